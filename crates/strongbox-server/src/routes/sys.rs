//! System routes: `/v1/sys/*`.
//!
//! Initialization, the seal/unseal lifecycle, HA status, keyring rotation,
//! the rekey and generate-root ceremonies, and response unwrapping. The
//! unauthenticated subset (`init`, `unseal`, `seal-status`, `health`,
//! `leader`) must work while sealed; everything else authorizes through
//! the core.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use strongbox_core::core::CoreState;
use strongbox_core::rekey::{RekeyMode, RekeyTarget};
use strongbox_core::router::Operation;

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::state::AppState;

/// Build the `/v1/sys` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/init", put(init).post(init))
        .route("/unseal", put(unseal).post(unseal))
        .route("/seal", put(seal).post(seal))
        .route("/seal-status", get(seal_status))
        .route("/health", get(health))
        .route("/leader", get(leader))
        .route("/step-down", put(step_down).post(step_down))
        .route("/rotate", put(rotate).post(rotate))
        .route("/rekey/init", put(rekey_init).post(rekey_init).delete(rekey_cancel))
        .route("/rekey/update", put(rekey_update).post(rekey_update))
        .route(
            "/generate-root/attempt",
            put(generate_root_init)
                .post(generate_root_init)
                .get(generate_root_status)
                .delete(generate_root_cancel),
        )
        .route(
            "/generate-root/update",
            put(generate_root_update).post(generate_root_update),
        )
        .route("/wrapping/unwrap", put(unwrap).post(unwrap))
}

// ── request / response bodies ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InitRequest {
    secret_shares: u8,
    secret_threshold: u8,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    keys: Vec<String>,
    recovery_keys: Vec<String>,
    root_token: String,
}

#[derive(Debug, Deserialize)]
struct UnsealRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    reset: bool,
}

#[derive(Debug, Serialize)]
struct UnsealResponse {
    sealed: bool,
    threshold: u8,
    progress: u8,
}

#[derive(Debug, Deserialize)]
struct RekeyInitRequest {
    secret_shares: u8,
    secret_threshold: u8,
    #[serde(default)]
    rotate_root: bool,
    #[serde(default)]
    recovery_key: bool,
}

#[derive(Debug, Serialize)]
struct RekeyStatusResponse {
    started: bool,
    nonce: String,
    progress: u8,
    required: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    keys: Vec<String>,
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct ShareUpdateRequest {
    key: String,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct UnwrapRequest {
    #[serde(default)]
    token: Option<String>,
}

// ── unauthenticated handlers ─────────────────────────────────────────

async fn init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let result = state
        .core
        .initialize(body.secret_shares, body.secret_threshold)
        .await?;
    Ok(Json(InitResponse {
        keys: result.keys.unseal_shares,
        recovery_keys: result.keys.recovery_shares,
        root_token: result.root_token,
    }))
}

async fn unseal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<UnsealResponse>, AppError> {
    if body.reset {
        state.core.unseal_reset().await;
        let status = state.core.seal_manager().status().await?;
        return Ok(Json(UnsealResponse {
            sealed: status.sealed,
            threshold: status.threshold,
            progress: 0,
        }));
    }

    let key = body.key.ok_or_else(|| {
        AppError::BadRequest("either 'key' or 'reset' must be provided".to_owned())
    })?;
    match state.core.unseal_submit(&key).await? {
        Some(progress) => Ok(Json(UnsealResponse {
            sealed: true,
            threshold: progress.threshold,
            progress: progress.progress,
        })),
        None => Ok(Json(UnsealResponse {
            sealed: false,
            threshold: 0,
            progress: 0,
        })),
    }
}

async fn seal_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.core.seal_manager().status().await?;
    Ok(Json(status))
}

/// Health: 200 active, 429 standby (per convention, still healthy), 501
/// uninitialized, 503 sealed.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let core_state = state.core.state().await;
    let status = match core_state {
        CoreState::Active => StatusCode::OK,
        CoreState::Standby => StatusCode::TOO_MANY_REQUESTS,
        CoreState::Uninitialized => StatusCode::NOT_IMPLEMENTED,
        CoreState::Sealed | CoreState::Recovery => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(serde_json::json!({
            "initialized": core_state != CoreState::Uninitialized,
            "sealed": matches!(core_state, CoreState::Sealed | CoreState::Uninitialized),
            "standby": core_state == CoreState::Standby,
        })),
    )
}

async fn leader(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let leader = state.core.leader().await?;
    let is_self = leader
        .as_ref()
        .is_some_and(|r| r.holder == state.core.config().node_id);
    Ok(Json(serde_json::json!({
        "ha_enabled": state.core.config().ha_enabled,
        "is_self": is_self,
        "leader_address": leader.and_then(|r| r.api_addr),
    })))
}

// ── authenticated handlers ───────────────────────────────────────────

async fn seal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/seal", Operation::Update, None)
        .await?;
    state.core.seal().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn step_down(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/step-down", Operation::Update, None)
        .await?;
    state.core.step_down().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/rotate", Operation::Update, None)
        .await?;
    let term = state.core.rotate().await?;
    Ok(Json(serde_json::json!({ "term": term })))
}

async fn rekey_init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RekeyInitRequest>,
) -> Result<Json<RekeyStatusResponse>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/rekey/init", Operation::Update, None)
        .await?;

    let mode = if body.rotate_root {
        RekeyMode::RotateRoot
    } else {
        RekeyMode::SplitOnly
    };
    let target = if body.recovery_key {
        RekeyTarget::Recovery
    } else {
        RekeyTarget::Barrier
    };
    let nonce = state
        .core
        .rekey()
        .init(body.secret_shares, body.secret_threshold, mode, target)
        .await?;

    let status = state.core.rekey().status().await?;
    Ok(Json(RekeyStatusResponse {
        started: true,
        nonce,
        progress: status.progress,
        required: status.required,
        keys: Vec::new(),
        complete: false,
    }))
}

async fn rekey_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/rekey/init", Operation::Delete, None)
        .await?;
    state.core.rekey().cancel().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn rekey_update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ShareUpdateRequest>,
) -> Result<Json<RekeyStatusResponse>, AppError> {
    // Share holders are not token holders; the nonce is the shared
    // authorization context.
    match state.core.rekey().submit_share(&body.nonce, &body.key).await? {
        Some(result) => Ok(Json(RekeyStatusResponse {
            started: false,
            nonce: result.nonce,
            progress: 0,
            required: 0,
            keys: result.shares,
            complete: true,
        })),
        None => {
            let status = state.core.rekey().status().await?;
            Ok(Json(RekeyStatusResponse {
                started: status.started,
                nonce: status.nonce,
                progress: status.progress,
                required: status.required,
                keys: Vec::new(),
                complete: false,
            }))
        }
    }
}

async fn generate_root_init(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let nonce = state.core.generate_root_init().await?;
    Ok(Json(serde_json::json!({ "started": true, "nonce": nonce })))
}

async fn generate_root_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.core.generate_root_status().await?;
    Ok(Json(status))
}

async fn generate_root_cancel(State(state): State<Arc<AppState>>) -> StatusCode {
    state.core.generate_root_cancel().await;
    StatusCode::NO_CONTENT
}

async fn generate_root_update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ShareUpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    match state
        .core
        .generate_root_submit(&body.nonce, &body.key)
        .await?
    {
        Some(root_token) => Ok(Json(serde_json::json!({
            "complete": true,
            "root_token": root_token,
        }))),
        None => {
            let status = state.core.generate_root_status().await?;
            Ok(Json(serde_json::json!({
                "complete": false,
                "progress": status.progress,
                "required": status.required,
            })))
        }
    }
}

async fn unwrap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<UnwrapRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    // The wrapping token comes from the body, falling back to the request
    // token itself.
    let wrap_token = body
        .and_then(|Json(b)| b.token)
        .or_else(|| meta.token.clone())
        .ok_or_else(|| AppError::BadRequest("missing wrapping token".to_owned()))?;

    let response = state.core.unwrap_response(&wrap_token).await?;
    Ok(Json(response))
}

pub(crate) fn require_token(meta: &RequestMeta) -> Result<&str, AppError> {
    meta.token
        .as_deref()
        .ok_or_else(|| AppError::Forbidden("missing client token".to_owned()))
}
