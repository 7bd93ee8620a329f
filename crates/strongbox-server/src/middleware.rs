//! Request metadata extraction.
//!
//! Pulls the protocol headers out of each request: the client token
//! (`X-Vault-Token` or `Authorization: Bearer`), the logical namespace,
//! response-wrapping directives, and the no-forwarding flag. Token
//! *validation* happens in the core's request pipeline; this layer only
//! carries the material.

use axum::http::HeaderMap;

/// Client token header.
pub const TOKEN_HEADER: &str = "X-Vault-Token";
/// Namespace header.
pub const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
/// Response-wrapping TTL header.
pub const WRAP_TTL_HEADER: &str = "X-Vault-Wrap-TTL";
/// Response-wrapping format header.
pub const WRAP_FORMAT_HEADER: &str = "X-Vault-Wrap-Format";
/// Redirect instead of forwarding on a standby.
pub const NO_FORWARD_HEADER: &str = "X-Vault-No-Request-Forwarding";

/// Extracted per-request protocol metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// The raw client token, if present.
    pub token: Option<String>,
    /// Logical namespace (default `root`).
    pub namespace: String,
    /// Requested response-wrapping TTL in seconds.
    pub wrap_ttl: Option<i64>,
    /// Requested wrapping format (`token` or `jwt`).
    pub wrap_format: Option<String>,
    /// Client prefers a 307 redirect over forwarding.
    pub no_forwarding: bool,
}

impl RequestMeta {
    /// Extract metadata from request headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| {
                headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(str::to_owned)
            });

        let namespace = headers
            .get(NAMESPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| "root".to_owned(), |ns| ns.trim_matches('/').to_owned());

        let wrap_ttl = headers
            .get(WRAP_TTL_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_duration_secs);

        let wrap_format = headers
            .get(WRAP_FORMAT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let no_forwarding = headers
            .get(NO_FORWARD_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "true" || v == "1");

        Self {
            token,
            namespace,
            wrap_ttl,
            wrap_format,
            no_forwarding,
        }
    }
}

/// Parse a duration string: bare seconds, or `30s` / `5m` / `2h` suffixes.
fn parse_duration_secs(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then_some(secs);
    }
    let (number, multiplier) = match value.split_last_char()? {
        (rest, 's') => (rest, 1),
        (rest, 'm') => (rest, 60),
        (rest, 'h') => (rest, 3600),
        _ => return None,
    };
    let parsed = number.parse::<i64>().ok()?;
    (parsed > 0).then(|| parsed.saturating_mul(multiplier))
}

trait SplitLastChar {
    fn split_last_char(&self) -> Option<(&str, char)>;
}

impl SplitLastChar for str {
    fn split_last_char(&self) -> Option<(&str, char)> {
        let ch = self.chars().last()?;
        Some((&self[..self.len() - ch.len_utf8()], ch))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("s.abc"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s.def"),
        );
        let meta = RequestMeta::from_headers(&headers);
        assert_eq!(meta.token.as_deref(), Some("s.abc"));
    }

    #[test]
    fn bearer_token_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s.def"),
        );
        let meta = RequestMeta::from_headers(&headers);
        assert_eq!(meta.token.as_deref(), Some("s.def"));
    }

    #[test]
    fn namespace_defaults_to_root() {
        let meta = RequestMeta::from_headers(&HeaderMap::new());
        assert_eq!(meta.namespace, "root");

        let mut headers = HeaderMap::new();
        headers.insert(NAMESPACE_HEADER, HeaderValue::from_static("team-a/"));
        let meta = RequestMeta::from_headers(&headers);
        assert_eq!(meta.namespace, "team-a");
    }

    #[test]
    fn wrap_ttl_parses_durations() {
        assert_eq!(parse_duration_secs("300"), Some(300));
        assert_eq!(parse_duration_secs("30s"), Some(30));
        assert_eq!(parse_duration_secs("5m"), Some(300));
        assert_eq!(parse_duration_secs("2h"), Some(7200));
        assert_eq!(parse_duration_secs("0"), None);
        assert_eq!(parse_duration_secs("bogus"), None);
    }

    #[test]
    fn no_forwarding_flag() {
        let mut headers = HeaderMap::new();
        headers.insert(NO_FORWARD_HEADER, HeaderValue::from_static("true"));
        assert!(RequestMeta::from_headers(&headers).no_forwarding);
    }
}
