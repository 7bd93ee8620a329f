//! ACL policies: storage, compilation, and evaluation.
//!
//! Policies are JSON documents holding path rules. Each rule maps a path
//! pattern to capabilities plus optional parameter constraints and
//! wrapping/pagination bounds. Patterns support exact match, globs (`*`,
//! `**`), and identity templates (`{{identity.entity.id}}`,
//! `{{identity.entity.aliases.<accessor>.name}}`) expanded once per
//! evaluation against the resolved entity.
//!
//! Evaluation unions capabilities from every matching rule across every
//! attached policy: `deny` overrides everything, `root` bypasses checks,
//! `sudo` is tracked for privileged paths. Parameter constraints are
//! allow/deny lists plus required keys; `pagination_limit` clamps list and
//! scan pages.
//!
//! Two built-ins exist: `root` (everything) and `default` (token
//! self-management). Writes are check-and-set on `cas_version`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::barrier::Barrier;
use crate::error::PolicyError;
use crate::identity::Entity;
use crate::router::Operation;

/// Storage prefix for ACL policy documents.
const POLICY_PREFIX: &str = "sys/policy/acl/";

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Create new items.
    Create,
    /// Read items.
    Read,
    /// Update existing items.
    Update,
    /// Delete items.
    Delete,
    /// List keys under a prefix.
    List,
    /// Recursive listing.
    Scan,
    /// Partial update.
    Patch,
    /// Privileged system operations.
    Sudo,
    /// Explicitly deny access (overrides all grants).
    Deny,
    /// Bypass all checks (built-in `root` policy only).
    Root,
}

impl Capability {
    /// The capability required for a logical operation.
    #[must_use]
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::Create,
            Operation::Read => Self::Read,
            Operation::Update | Operation::Renew => Self::Update,
            Operation::Delete | Operation::Revoke => Self::Delete,
            Operation::List => Self::List,
            Operation::Scan => Self::Scan,
            Operation::Patch => Self::Patch,
        }
    }
}

/// One path rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    /// Path pattern: exact, glob, or identity template.
    pub path: String,
    /// Granted capabilities.
    pub capabilities: Vec<Capability>,
    /// Minimum response-wrapping TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_wrapping_ttl: Option<i64>,
    /// Maximum response-wrapping TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wrapping_ttl: Option<i64>,
    /// Allowlist of request parameters (key → permitted values; empty list
    /// permits any value). When present, parameters outside the list are
    /// rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_parameters: Option<HashMap<String, Vec<serde_json::Value>>>,
    /// Denylist of request parameters (key → denied values; empty list
    /// denies the key outright).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_parameters: Option<HashMap<String, Vec<serde_json::Value>>>,
    /// Parameters that must be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_parameters: Vec<String>,
    /// MFA method names that must have been satisfied for this path.
    /// Recorded and surfaced to the transport; enforcement belongs to the
    /// MFA layer in front of the core.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mfa_methods: Vec<String>,
    /// Page-size ceiling for list/scan on this path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_limit: Option<i64>,
}

impl PathRule {
    /// A plain rule with capabilities only.
    #[must_use]
    pub fn new(path: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            path: path.into(),
            capabilities,
            min_wrapping_ttl: None,
            max_wrapping_ttl: None,
            allowed_parameters: None,
            denied_parameters: None,
            required_parameters: Vec::new(),
            mfa_methods: Vec::new(),
            pagination_limit: None,
        }
    }
}

/// A named policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy name.
    pub name: String,
    /// Path rules.
    pub paths: Vec<PathRule>,
    /// Check-and-set version, bumped on every successful write.
    #[serde(default)]
    pub cas_version: u64,
}

/// The outcome of a successful authorization.
#[derive(Debug, Clone, Default)]
pub struct AclDecision {
    /// The token carries the `root` policy.
    pub root: bool,
    /// A matching rule granted `sudo`.
    pub sudo: bool,
    /// Effective page-size ceiling for list/scan (minimum across rules).
    pub pagination_limit: Option<i64>,
    /// Minimum response-wrapping TTL across matching rules.
    pub min_wrapping_ttl: Option<i64>,
    /// Maximum response-wrapping TTL across matching rules.
    pub max_wrapping_ttl: Option<i64>,
}

/// Policy CRUD and ACL evaluation over the barrier.
pub struct PolicyStore {
    barrier: Arc<Barrier>,
    /// Serializes read-modify-write for check-and-set.
    write_lock: Mutex<()>,
}

impl PolicyStore {
    /// Create a policy store.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            write_lock: Mutex::new(()),
        }
    }

    /// Write a policy. When `cas` is `Some(v)`, the write only succeeds if
    /// the stored version is exactly `v` (0 for "must not exist").
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` / `default`.
    /// - [`PolicyError::Invalid`] for empty documents.
    /// - [`PolicyError::CasMismatch`] on a version conflict.
    pub async fn put(&self, policy: &Policy, cas: Option<u64>) -> Result<(), PolicyError> {
        if is_builtin(&policy.name) {
            return Err(PolicyError::BuiltIn {
                name: policy.name.clone(),
            });
        }
        if policy.paths.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must have at least one path rule".to_owned(),
            });
        }

        let _guard = self.write_lock.lock().await;

        let current = self.load(&policy.name).await?;
        let found = current.as_ref().map_or(0, |p| p.cas_version);
        if let Some(expected) = cas {
            if expected != found {
                return Err(PolicyError::CasMismatch {
                    name: policy.name.clone(),
                    expected,
                    found,
                });
            }
        }

        let mut stored = policy.clone();
        stored.cas_version = found.saturating_add(1);

        let bytes = serde_json::to_vec(&stored).map_err(|e| PolicyError::Invalid {
            reason: format!("serialization failed: {e}"),
        })?;
        self.barrier
            .put(&format!("{POLICY_PREFIX}{}", policy.name), &bytes)
            .await?;

        info!(name = %policy.name, rules = policy.paths.len(), "policy written");
        Ok(())
    }

    /// Read a policy by name. Built-ins are synthesized.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if absent.
    pub async fn get(&self, name: &str) -> Result<Policy, PolicyError> {
        if name == "root" {
            return Ok(root_policy());
        }
        if name == "default" {
            return Ok(default_policy());
        }
        self.load(name).await?.ok_or_else(|| PolicyError::NotFound {
            name: name.to_owned(),
        })
    }

    /// Delete a policy by name.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BuiltIn`] for `root` / `default`.
    pub async fn delete(&self, name: &str) -> Result<(), PolicyError> {
        if is_builtin(name) {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        self.barrier.delete(&format!("{POLICY_PREFIX}{name}")).await?;
        info!(name = %name, "policy deleted");
        Ok(())
    }

    /// List all policy names (built-ins included).
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] on storage failure.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let keys = self.barrier.list(POLICY_PREFIX).await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect();
        for builtin in ["default", "root"] {
            if !names.iter().any(|n| n == builtin) {
                names.push(builtin.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Evaluate the attached policies for `operation` on `path`.
    ///
    /// `params` are the request's top-level body keys; `entity` feeds
    /// template expansion. Policies granted through the entity are merged
    /// with the token's.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Denied`] if no rule grants the capability or a
    ///   matching rule denies it.
    /// - [`PolicyError::ParameterViolation`] on a parameter-constraint
    ///   failure.
    pub async fn authorize(
        &self,
        policy_names: &[String],
        entity: Option<&Entity>,
        path: &str,
        operation: Operation,
        params: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<AclDecision, PolicyError> {
        let mut names: Vec<&str> = policy_names.iter().map(String::as_str).collect();
        if let Some(entity) = entity {
            names.extend(entity.policies.iter().map(String::as_str));
        }

        if names.iter().any(|n| *n == "root") {
            return Ok(AclDecision {
                root: true,
                sudo: true,
                ..AclDecision::default()
            });
        }

        let capability = Capability::for_operation(operation);
        let mut decision = AclDecision::default();
        let mut granted = false;
        let mut matching_rules: Vec<PathRule> = Vec::new();

        for name in names {
            let policy = match self.get(name).await {
                Ok(policy) => policy,
                Err(PolicyError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            for rule in &policy.paths {
                let Some(pattern) = expand_template(&rule.path, entity) else {
                    continue;
                };
                if !path_matches(&pattern, path) {
                    continue;
                }

                if rule.capabilities.contains(&Capability::Deny) {
                    return Err(PolicyError::Denied {
                        path: path.to_owned(),
                        capability: format!("{capability:?}").to_lowercase(),
                    });
                }
                if rule.capabilities.contains(&capability)
                    || rule.capabilities.contains(&Capability::Root)
                {
                    granted = true;
                }
                if rule.capabilities.contains(&Capability::Sudo) {
                    decision.sudo = true;
                }
                matching_rules.push(rule.clone());
            }
        }

        if !granted {
            return Err(PolicyError::Denied {
                path: path.to_owned(),
                capability: format!("{capability:?}").to_lowercase(),
            });
        }

        check_parameters(&matching_rules, path, params)?;

        for rule in &matching_rules {
            if let Some(limit) = rule.pagination_limit {
                decision.pagination_limit = Some(match decision.pagination_limit {
                    Some(existing) => existing.min(limit),
                    None => limit,
                });
            }
            if let Some(ttl) = rule.min_wrapping_ttl {
                decision.min_wrapping_ttl =
                    Some(decision.min_wrapping_ttl.map_or(ttl, |e: i64| e.max(ttl)));
            }
            if let Some(ttl) = rule.max_wrapping_ttl {
                decision.max_wrapping_ttl =
                    Some(decision.max_wrapping_ttl.map_or(ttl, |e: i64| e.min(ttl)));
            }
        }

        Ok(decision)
    }

    async fn load(&self, name: &str) -> Result<Option<Policy>, PolicyError> {
        let Some(bytes) = self.barrier.get(&format!("{POLICY_PREFIX}{name}")).await? else {
            return Ok(None);
        };
        let policy = serde_json::from_slice(&bytes).map_err(|e| PolicyError::Invalid {
            reason: format!("deserialization failed: {e}"),
        })?;
        Ok(Some(policy))
    }
}

fn is_builtin(name: &str) -> bool {
    name == "root" || name == "default"
}

/// The built-in `root` policy.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: "root".to_owned(),
        paths: vec![PathRule::new("**", vec![Capability::Root])],
        cas_version: 0,
    }
}

/// The built-in `default` policy: token self-management.
#[must_use]
pub fn default_policy() -> Policy {
    Policy {
        name: "default".to_owned(),
        paths: vec![
            PathRule::new("auth/token/lookup-self", vec![Capability::Read]),
            PathRule::new("auth/token/renew-self", vec![Capability::Update]),
            PathRule::new("auth/token/revoke-self", vec![Capability::Update]),
            PathRule::new("cubbyhole/**", vec![
                Capability::Create,
                Capability::Read,
                Capability::Update,
                Capability::Delete,
                Capability::List,
            ]),
        ],
        cas_version: 0,
    }
}

/// Expand identity templates in a pattern. Returns `None` when the pattern
/// references identity attributes that cannot be resolved — such a rule
/// matches nothing.
fn expand_template(pattern: &str, entity: Option<&Entity>) -> Option<String> {
    if !pattern.contains("{{") {
        return Some(pattern.to_owned());
    }
    let entity = entity?;

    let mut expanded = pattern
        .replace("{{identity.entity.id}}", &entity.id)
        .replace("{{identity.entity.name}}", &entity.name);

    // {{identity.entity.aliases.<accessor>.name}}
    while let Some(start) = expanded.find("{{identity.entity.aliases.") {
        let rest = &expanded[start..];
        let end = rest.find("}}")?;
        let inner = &rest[2..end];
        let accessor = inner
            .strip_prefix("identity.entity.aliases.")?
            .strip_suffix(".name")?;
        let name = entity.alias_for(accessor)?.name.clone();
        expanded = format!(
            "{}{}{}",
            &expanded[..start],
            name,
            &expanded[start + end + 2..]
        );
    }

    if expanded.contains("{{") {
        return None;
    }
    Some(expanded)
}

/// Match a path against a pattern supporting `*` and `**` globs.
fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    glob_match::glob_match(pattern, path)
}

fn check_parameters(
    rules: &[PathRule],
    path: &str,
    params: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Result<(), PolicyError> {
    let empty = serde_json::Map::new();
    let params = params.unwrap_or(&empty);

    for rule in rules {
        for required in &rule.required_parameters {
            if !params.contains_key(required) {
                return Err(PolicyError::ParameterViolation {
                    path: path.to_owned(),
                    reason: format!("required parameter '{required}' is missing"),
                });
            }
        }

        if let Some(denied) = &rule.denied_parameters {
            for (key, value) in params {
                if let Some(denied_values) = denied.get(key) {
                    if denied_values.is_empty() || denied_values.contains(value) {
                        return Err(PolicyError::ParameterViolation {
                            path: path.to_owned(),
                            reason: format!("parameter '{key}' is denied"),
                        });
                    }
                }
            }
        }

        if let Some(allowed) = &rule.allowed_parameters {
            if !allowed.is_empty() {
                for (key, value) in params {
                    let Some(allowed_values) = allowed.get(key) else {
                        return Err(PolicyError::ParameterViolation {
                            path: path.to_owned(),
                            reason: format!("parameter '{key}' is not in the allowlist"),
                        });
                    };
                    if !allowed_values.is_empty() && !allowed_values.contains(value) {
                        return Err(PolicyError::ParameterViolation {
                            path: path.to_owned(),
                            reason: format!("value for parameter '{key}' is not permitted"),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::AeadAlgorithm;
    use strongbox_storage::MemoryBackend;

    async fn store() -> PolicyStore {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        PolicyStore::new(barrier)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn crud_roundtrip_with_cas() {
        let store = store().await;
        let policy = Policy {
            name: "app".to_owned(),
            paths: vec![PathRule::new("secret/data/app/*", vec![Capability::Read])],
            cas_version: 0,
        };

        store.put(&policy, Some(0)).await.unwrap();
        let loaded = store.get("app").await.unwrap();
        assert_eq!(loaded.cas_version, 1);

        // Stale CAS fails, current CAS succeeds.
        let err = store.put(&policy, Some(0)).await.unwrap_err();
        assert!(matches!(err, PolicyError::CasMismatch { found: 1, .. }));
        store.put(&policy, Some(1)).await.unwrap();

        store.delete("app").await.unwrap();
        assert!(matches!(
            store.get("app").await,
            Err(PolicyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn builtins_are_protected_and_listed() {
        let store = store().await;
        assert!(matches!(
            store.put(&root_policy(), None).await,
            Err(PolicyError::BuiltIn { .. })
        ));
        assert!(matches!(
            store.delete("default").await,
            Err(PolicyError::BuiltIn { .. })
        ));
        let listed = store.list().await.unwrap();
        assert!(listed.contains(&"root".to_owned()));
        assert!(listed.contains(&"default".to_owned()));
    }

    #[tokio::test]
    async fn root_policy_bypasses_checks() {
        let store = store().await;
        let decision = store
            .authorize(&names(&["root"]), None, "anything/at/all", Operation::Delete, None)
            .await
            .unwrap();
        assert!(decision.root);
    }

    #[tokio::test]
    async fn deny_overrides_grants() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "grant".to_owned(),
                    paths: vec![PathRule::new("secret/**", vec![Capability::Read])],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();
        store
            .put(
                &Policy {
                    name: "deny".to_owned(),
                    paths: vec![PathRule::new("secret/data/prod/*", vec![Capability::Deny])],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        store
            .authorize(
                &names(&["grant", "deny"]),
                None,
                "secret/data/dev/x",
                Operation::Read,
                None,
            )
            .await
            .unwrap();

        let err = store
            .authorize(
                &names(&["grant", "deny"]),
                None,
                "secret/data/prod/x",
                Operation::Read,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Denied { .. }));
    }

    #[tokio::test]
    async fn unmatched_path_is_denied() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "narrow".to_owned(),
                    paths: vec![PathRule::new("secret/data/app", vec![Capability::Read])],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let err = store
            .authorize(
                &names(&["narrow"]),
                None,
                "secret/data/other",
                Operation::Read,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Denied { .. }));
    }

    #[tokio::test]
    async fn capability_must_match_operation() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "ro".to_owned(),
                    paths: vec![PathRule::new("secret/**", vec![Capability::Read])],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let err = store
            .authorize(&names(&["ro"]), None, "secret/data/x", Operation::Update, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Denied { .. }));
    }

    #[tokio::test]
    async fn template_expands_entity_id() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "per-entity".to_owned(),
                    paths: vec![PathRule::new(
                        "secret/data/{{identity.entity.id}}/*",
                        vec![Capability::Read, Capability::Update],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let mut entity = Entity::new("svc");
        entity.id = "E123".to_owned();

        store
            .authorize(
                &names(&["per-entity"]),
                Some(&entity),
                "secret/data/E123/x",
                Operation::Update,
                None,
            )
            .await
            .unwrap();

        let err = store
            .authorize(
                &names(&["per-entity"]),
                Some(&entity),
                "secret/data/E999/x",
                Operation::Update,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Denied { .. }));
    }

    #[tokio::test]
    async fn template_without_entity_matches_nothing() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "templated".to_owned(),
                    paths: vec![PathRule::new(
                        "secret/data/{{identity.entity.id}}/*",
                        vec![Capability::Read],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let err = store
            .authorize(
                &names(&["templated"]),
                None,
                "secret/data/E123/x",
                Operation::Read,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Denied { .. }));
    }

    #[tokio::test]
    async fn alias_template_expansion() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "alias".to_owned(),
                    paths: vec![PathRule::new(
                        "secret/data/{{identity.entity.aliases.auth_token_ab12.name}}/*",
                        vec![Capability::Read],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let mut entity = Entity::new("svc");
        entity.aliases.push(crate::identity::Alias {
            mount_accessor: "auth_token_ab12".to_owned(),
            name: "svc-login".to_owned(),
        });

        store
            .authorize(
                &names(&["alias"]),
                Some(&entity),
                "secret/data/svc-login/creds",
                Operation::Read,
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn parameter_constraints_enforced() {
        let store = store().await;
        let mut rule = PathRule::new("secret/data/app", vec![Capability::Update]);
        rule.required_parameters = vec!["ttl".to_owned()];
        rule.denied_parameters = Some(HashMap::from([(
            "admin".to_owned(),
            Vec::<serde_json::Value>::new(),
        )]));
        rule.allowed_parameters = Some(HashMap::from([
            ("ttl".to_owned(), Vec::new()),
            ("value".to_owned(), vec![serde_json::json!("a"), serde_json::json!("b")]),
        ]));
        store
            .put(
                &Policy {
                    name: "params".to_owned(),
                    paths: vec![rule],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let authorize = |params: serde_json::Value| {
            let store = &store;
            async move {
                let map = params.as_object().cloned();
                store
                    .authorize(
                        &names(&["params"]),
                        None,
                        "secret/data/app",
                        Operation::Update,
                        map.as_ref(),
                    )
                    .await
            }
        };

        // Valid: required present, values allowed.
        authorize(serde_json::json!({"ttl": "1h", "value": "a"}))
            .await
            .unwrap();

        // Missing required parameter.
        let err = authorize(serde_json::json!({"value": "a"})).await.unwrap_err();
        assert!(matches!(err, PolicyError::ParameterViolation { .. }));

        // Denied key.
        let err = authorize(serde_json::json!({"ttl": "1h", "admin": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ParameterViolation { .. }));

        // Value outside the allowlist.
        let err = authorize(serde_json::json!({"ttl": "1h", "value": "zzz"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ParameterViolation { .. }));

        // Key outside the allowlist.
        let err = authorize(serde_json::json!({"ttl": "1h", "other": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ParameterViolation { .. }));
    }

    #[tokio::test]
    async fn pagination_limit_takes_minimum() {
        let store = store().await;
        let mut wide = PathRule::new("secret/**", vec![Capability::List]);
        wide.pagination_limit = Some(500);
        let mut narrow = PathRule::new("secret/data/*", vec![Capability::List]);
        narrow.pagination_limit = Some(50);
        store
            .put(
                &Policy {
                    name: "paged".to_owned(),
                    paths: vec![wide, narrow],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let decision = store
            .authorize(
                &names(&["paged"]),
                None,
                "secret/data/x",
                Operation::List,
                None,
            )
            .await
            .unwrap();
        assert_eq!(decision.pagination_limit, Some(50));
    }

    #[tokio::test]
    async fn sudo_is_tracked() {
        let store = store().await;
        store
            .put(
                &Policy {
                    name: "ops".to_owned(),
                    paths: vec![PathRule::new(
                        "sys/rotate",
                        vec![Capability::Update, Capability::Sudo],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let decision = store
            .authorize(&names(&["ops"]), None, "sys/rotate", Operation::Update, None)
            .await
            .unwrap();
        assert!(decision.sudo);
    }
}
