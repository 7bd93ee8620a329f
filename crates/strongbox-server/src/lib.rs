//! Strongbox HTTP server.
//!
//! Wires the core, a storage backend, and the `/v1` JSON API into a
//! running axum server.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Response header naming the node that serviced the request.
pub const NODE_ID_HEADER: &str = "x-vault-raft-node-id";

/// Build the full `/v1` router with middleware layers.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    let node_id_header = HeaderValue::from_str(&state.core.config().node_id)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

    Router::new()
        .nest("/v1/sys", routes::sys::router())
        .nest("/v1/sys", routes::mounts::router())
        .nest("/v1/sys", routes::audit::router())
        .nest("/v1/sys/policies", routes::policy::router())
        .nest("/v1/sys/leases", routes::leases::router())
        .nest("/v1/auth/token", routes::auth::router())
        .nest("/v1", routes::logical::router())
        .layer(TraceLayer::new_for_http())
        // A forwarded response already names the node that serviced it
        // (the leader); only locally-handled responses get stamped here.
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::HeaderName::from_static(NODE_ID_HEADER),
            node_id_header,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}
