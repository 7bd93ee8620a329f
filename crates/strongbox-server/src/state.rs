//! Shared application state.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! handlers via `Arc`. Beyond the core handle it carries the pieces of
//! server config the handlers need (request timeout, advertised address).

use std::sync::Arc;

use strongbox_core::core::Core;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The composed server core.
    pub core: Arc<Core>,
    /// Maximum request duration.
    pub request_timeout: std::time::Duration,
    /// HTTP client used for standby → leader forwarding.
    pub forward_client: reqwest::Client,
}

impl AppState {
    /// Build the state.
    #[must_use]
    pub fn new(core: Arc<Core>, request_timeout_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            core,
            request_timeout: std::time::Duration::from_secs(request_timeout_secs),
            forward_client: reqwest::Client::new(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
