//! End-to-end lifecycle scenarios against a composed core.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;

use strongbox_core::core::{Core, CoreConfig, CoreState, SealKind};
use strongbox_core::error::CoreError;
use strongbox_core::policy::{Capability, PathRule, Policy};
use strongbox_core::router::{Operation, Request};
use strongbox_core::token::CreateTokenParams;
use strongbox_storage::{MemoryBackend, StorageBackend};

fn config() -> CoreConfig {
    CoreConfig {
        node_id: "node-test".to_owned(),
        api_addr: Some("http://127.0.0.1:8200".to_owned()),
        ..CoreConfig::default()
    }
}

async fn new_core(storage: Arc<dyn StorageBackend>) -> Arc<Core> {
    Core::new(storage, SealKind::Shamir, config()).await
}

fn read(path: &str, token: &str) -> Request {
    Request::new(Operation::Read, path).with_token(token)
}

fn write(path: &str, token: &str, data: serde_json::Value) -> Request {
    Request::new(Operation::Create, path)
        .with_token(token)
        .with_data(data)
}

#[tokio::test]
async fn init_write_seal_restart_unseal_read() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let core = new_core(Arc::clone(&storage)).await;

    // Init with 5 shares, threshold 3.
    let init = core.initialize(5, 3).await.unwrap();
    assert_eq!(init.keys.unseal_shares.len(), 5);
    assert_eq!(core.state().await, CoreState::Active);

    // Write a secret with the root token.
    core.handle_request(write(
        "secret/data/hello",
        &init.root_token,
        serde_json::json!({"data": {"v": "world"}}),
    ))
    .await
    .unwrap();

    // Seal.
    core.seal().await.unwrap();
    assert_eq!(core.state().await, CoreState::Sealed);
    assert!(matches!(
        core.handle_request(read("secret/data/hello", &init.root_token))
            .await,
        Err(CoreError::Sealed)
    ));

    // "Restart": a fresh core over the same storage.
    let core = new_core(storage).await;
    assert_eq!(core.state().await, CoreState::Sealed);

    // Unseal with shares 2, 4, 1 — unsealed after the third.
    let shares = &init.keys.unseal_shares;
    assert!(core.unseal_submit(&shares[1]).await.unwrap().is_some());
    assert!(core.unseal_submit(&shares[3]).await.unwrap().is_some());
    assert!(core.unseal_submit(&shares[0]).await.unwrap().is_none());
    assert_eq!(core.state().await, CoreState::Active);

    // The secret survived.
    let response = core
        .handle_request(read("secret/data/hello", &init.root_token))
        .await
        .unwrap();
    assert_eq!(response.data.unwrap()["data"]["v"], "world");
}

#[tokio::test]
async fn parent_token_revocation_cascades_to_children_and_leases() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    // Parent with a 1h TTL, child from the parent.
    let (parent, _) = core
        .create_token(
            &init.root_token,
            CreateTokenParams {
                policies: vec!["default".to_owned()],
                ttl_secs: 3600,
                renewable: true,
                display_name: "parent".to_owned(),
                ..CreateTokenParams::default()
            },
        )
        .await
        .unwrap();
    let (child, _) = core
        .create_token(
            &parent,
            CreateTokenParams {
                policies: vec!["default".to_owned()],
                ttl_secs: 600,
                renewable: true,
                display_name: "child".to_owned(),
                ..CreateTokenParams::default()
            },
        )
        .await
        .unwrap();

    // Revoke the parent: the child and its leases disappear.
    core.revoke_token(&parent).await.unwrap();

    assert!(core.tokens().lookup(&parent).await.is_err());
    assert!(core.tokens().lookup(&child).await.is_err());
    assert_eq!(core.expiration().lease_count().await.unwrap(), 0);
}

#[tokio::test]
async fn policy_template_scopes_by_entity() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    // Entity E123 and a templated policy.
    let mut entity = strongbox_core::identity::Entity::new("svc");
    entity.id = "E123".to_owned();
    core.identity().put(&entity).await.unwrap();

    core.policies()
        .put(
            &Policy {
                name: "per-entity".to_owned(),
                paths: vec![PathRule::new(
                    "secret/data/{{identity.entity.id}}/*",
                    vec![Capability::Read, Capability::Create, Capability::Update],
                )],
                cas_version: 0,
            },
            None,
        )
        .await
        .unwrap();

    let (token, _) = core
        .create_token(
            &init.root_token,
            CreateTokenParams {
                policies: vec!["per-entity".to_owned()],
                ttl_secs: 3600,
                entity_id: Some("E123".to_owned()),
                renewable: true,
                display_name: "templated".to_owned(),
                ..CreateTokenParams::default()
            },
        )
        .await
        .unwrap();

    // The entity's own subtree works.
    core.handle_request(write(
        "secret/data/E123/x",
        &token,
        serde_json::json!({"data": {"v": 1}}),
    ))
    .await
    .unwrap();

    // Another entity's subtree is forbidden.
    let err = core
        .handle_request(write(
            "secret/data/E999/x",
            &token,
            serde_json::json!({"data": {"v": 1}}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Policy(_)));
}

#[tokio::test]
async fn list_pagination_walks_without_gaps() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    for i in 1..=10u32 {
        core.handle_request(write(
            &format!("secret/data/a/{i:02}"),
            &init.root_token,
            serde_json::json!({"data": {"n": i}}),
        ))
        .await
        .unwrap();
    }

    let mut collected = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let mut request = Request::new(Operation::List, "secret/data/a").with_token(&init.root_token);
        request.after.clone_from(&after);
        request.limit = Some(3);
        let response = core.handle_request(request).await.unwrap();
        let keys: Vec<String> =
            serde_json::from_value(response.data.unwrap()["keys"].clone()).unwrap();
        if keys.is_empty() {
            break;
        }
        after = keys.last().cloned();
        collected.extend(keys);
    }

    let expected: Vec<String> = (1..=10u32).map(|i| format!("{i:02}")).collect();
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn wrapped_response_unwraps_once() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    core.handle_request(write(
        "secret/data/wrapme",
        &init.root_token,
        serde_json::json!({"data": {"v": "hidden"}}),
    ))
    .await
    .unwrap();

    let mut request = read("secret/data/wrapme", &init.root_token);
    request.wrap_ttl = Some(300);
    let wrapped = core.handle_request(request).await.unwrap();
    assert!(wrapped.data.is_none());
    let wrap_token = wrapped.wrap_info.unwrap().token;

    let unwrapped = core.unwrap_response(&wrap_token).await.unwrap();
    let inner = unwrapped.data.unwrap();
    assert_eq!(inner["data"]["data"]["v"], "hidden");

    // Single use.
    assert!(core.unwrap_response(&wrap_token).await.is_err());
}

#[tokio::test]
async fn missing_token_is_denied() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    core.initialize(3, 2).await.unwrap();

    let err = core
        .handle_request(Request::new(Operation::Read, "secret/data/x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied { .. }));
}

#[tokio::test]
async fn default_policy_token_cannot_touch_secrets() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    let (token, _) = core
        .create_token(
            &init.root_token,
            CreateTokenParams {
                policies: vec!["default".to_owned()],
                ttl_secs: 3600,
                renewable: true,
                display_name: "limited".to_owned(),
                ..CreateTokenParams::default()
            },
        )
        .await
        .unwrap();

    let err = core
        .handle_request(read("secret/data/x", &token))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Policy(_)));
}

#[tokio::test]
async fn mount_lifecycle_through_the_core() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    core.mount("team-a/", "kv", "team A".to_owned(), HashMap::new())
        .await
        .unwrap();

    core.handle_request(write(
        "team-a/data/creds",
        &init.root_token,
        serde_json::json!({"data": {"p": "s3cr3t"}}),
    ))
    .await
    .unwrap();

    // Remount and read through the new path.
    core.remount("team-a/", "team-b/").await.unwrap();
    let response = core
        .handle_request(read("team-b/data/creds", &init.root_token))
        .await
        .unwrap();
    assert_eq!(response.data.unwrap()["data"]["p"], "s3cr3t");

    // Unmount removes the route.
    core.unmount("team-b/").await.unwrap();
    let err = core
        .handle_request(read("team-b/data/creds", &init.root_token))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Engine(_)));
}

#[tokio::test]
async fn generate_root_ceremony_mints_a_root_token() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(5, 3).await.unwrap();

    let nonce = core.generate_root_init().await.unwrap();
    let shares = &init.keys.unseal_shares;
    assert!(core
        .generate_root_submit(&nonce, &shares[0])
        .await
        .unwrap()
        .is_none());
    assert!(core
        .generate_root_submit(&nonce, &shares[2])
        .await
        .unwrap()
        .is_none());
    let token = core
        .generate_root_submit(&nonce, &shares[4])
        .await
        .unwrap()
        .unwrap();

    let entry = core.tokens().lookup(&token).await.unwrap();
    assert!(entry.is_root());
}

#[tokio::test]
async fn audit_devices_enable_log_and_disable() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("audit.log");
    core.enable_audit_device(strongbox_core::audit::AuditDeviceEntry {
        name: "ops".to_owned(),
        sink_type: "file".to_owned(),
        options: HashMap::from([(
            "file_path".to_owned(),
            log_path.display().to_string(),
        )]),
        blocking: false,
    })
    .await
    .unwrap();

    let listed = core.list_audit_devices().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "ops");

    // A handled request produces request + response entries.
    core.handle_request(write(
        "secret/data/audited",
        &init.root_token,
        serde_json::json!({"data": {"v": 1}}),
    ))
    .await
    .unwrap();
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("secret/data/audited"));
    // The token itself never reaches the log.
    assert!(!content.contains(&init.root_token));

    // Devices survive a seal cycle through their persisted records.
    core.seal().await.unwrap();
    for share in &init.keys.unseal_shares[..2] {
        core.unseal_submit(share).await.unwrap();
    }
    assert_eq!(core.registered_audit_devices().await.len(), 1);

    core.disable_audit_device("ops").await.unwrap();
    assert!(core.list_audit_devices().await.unwrap().is_empty());
    assert!(core.disable_audit_device("ops").await.is_err());
}

#[tokio::test]
async fn unknown_audit_device_type_is_rejected() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    core.initialize(3, 2).await.unwrap();

    let err = core
        .enable_audit_device(strongbox_core::audit::AuditDeviceEntry {
            name: "syslog".to_owned(),
            sink_type: "socket".to_owned(),
            options: HashMap::new(),
            blocking: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRequest { .. }));
}

#[tokio::test]
async fn step_down_drops_to_standby_and_rejects_requests() {
    let core = new_core(Arc::new(MemoryBackend::new())).await;
    let init = core.initialize(3, 2).await.unwrap();

    core.step_down().await.unwrap();
    assert_eq!(core.state().await, CoreState::Standby);

    let err = core
        .handle_request(read("secret/data/x", &init.root_token))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Standby { .. }));
}
