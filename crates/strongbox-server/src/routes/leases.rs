//! Lease routes: `/v1/sys/leases/*`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use strongbox_core::router::Operation;

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::routes::sys::require_token;
use crate::state::AppState;

/// Build the `/v1/sys/leases` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lookup", put(lookup).post(lookup))
        .route("/renew", put(renew).post(renew))
        .route("/revoke", put(revoke).post(revoke))
        .route("/revoke-force", put(revoke_force).post(revoke_force))
        .route("/irrevocable", get(irrevocable))
}

#[derive(Debug, Deserialize)]
struct LeaseTarget {
    lease_id: String,
    #[serde(default)]
    increment: Option<i64>,
}

async fn lookup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LeaseTarget>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/leases/lookup", Operation::Update, None)
        .await?;

    let entry = state.core.expiration().lookup(&body.lease_id).await?;
    Ok(Json(serde_json::json!({
        "id": entry.lease_id,
        "issue_time": entry.issue_time.to_rfc3339(),
        "expire_time": entry.expire_time.to_rfc3339(),
        "last_renewal": entry.last_renewal.map(|t| t.to_rfc3339()),
        "renewable": entry.renewable,
        "irrevocable": entry.irrevocable,
    })))
}

async fn renew(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LeaseTarget>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/leases/renew", Operation::Update, None)
        .await?;

    let entry = state
        .core
        .expiration()
        .renew(&body.lease_id, body.increment.unwrap_or(3600))
        .await?;
    Ok(Json(serde_json::json!({
        "lease_id": entry.lease_id,
        "lease_duration": (entry.expire_time - chrono::Utc::now()).num_seconds().max(0),
        "renewable": entry.renewable,
    })))
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LeaseTarget>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/leases/revoke", Operation::Update, None)
        .await?;
    state.core.expiration().revoke(&body.lease_id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_force(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LeaseTarget>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    // Forced revocation abandons engine-side state; sudo territory.
    state
        .core
        .authorize_token(token, "sys/leases/revoke-force", Operation::Update, None)
        .await?;
    state.core.expiration().revoke(&body.lease_id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn irrevocable(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/leases/irrevocable", Operation::Read, None)
        .await?;

    let leases = state.core.expiration().irrevocable_leases().await?;
    let entries: Vec<serde_json::Value> = leases
        .iter()
        .map(|entry| {
            serde_json::json!({
                "id": entry.lease_id,
                "path": entry.path,
                "error": entry.irrevocable,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "leases": entries })))
}
