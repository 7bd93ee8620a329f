//! Mount management routes: `/v1/sys/mounts/*` and `/v1/sys/remount`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use strongbox_core::router::Operation;

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::routes::sys::require_token;
use crate::state::AppState;

/// Build the `/v1/sys/mounts` router (plus remount).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/mounts", get(list))
        .route(
            "/mounts/{*path}",
            post(mount_or_tune).put(mount_or_tune).delete(unmount),
        )
        .route("/remount", post(remount).put(remount))
}

#[derive(Debug, Deserialize)]
struct MountRequest {
    #[serde(rename = "type", default)]
    engine_type: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    options: HashMap<String, String>,
    /// Present on tune requests: expected `running_version` for CAS.
    #[serde(default)]
    version: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RemountRequest {
    from: String,
    to: String,
}

async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/mounts", Operation::Read, None)
        .await?;

    let mounts = state.core.list_mounts().await?;
    let mut data = serde_json::Map::new();
    for entry in mounts {
        data.insert(
            entry.path.clone(),
            serde_json::json!({
                "uuid": entry.uuid,
                "type": entry.engine_type,
                "accessor": entry.accessor,
                "description": entry.description,
                "options": entry.options,
                "local": entry.local,
                "seal_wrap": entry.seal_wrap,
                "running_version": entry.running_version,
            }),
        );
    }
    Ok(Json(serde_json::Value::Object(data)))
}

/// `POST sys/mounts/<path>` mounts; `POST sys/mounts/<path>/tune` tunes.
async fn mount_or_tune(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(body): Json<MountRequest>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(
            token,
            &format!("sys/mounts/{path}"),
            Operation::Update,
            None,
        )
        .await?;

    if let Some(mount_path) = path.strip_suffix("/tune").or_else(|| path.strip_suffix("tune")) {
        let expected = body.version.ok_or_else(|| {
            AppError::BadRequest("tune requires 'version' for check-and-set".to_owned())
        })?;
        state
            .core
            .tune_mount(
                mount_path,
                Some(body.description).filter(|d| !d.is_empty()),
                Some(body.options).filter(|o| !o.is_empty()),
                expected,
            )
            .await?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let engine_type = body
        .engine_type
        .ok_or_else(|| AppError::BadRequest("missing engine 'type'".to_owned()))?;
    state
        .core
        .mount(&path, &engine_type, body.description, body.options)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unmount(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(
            token,
            &format!("sys/mounts/{path}"),
            Operation::Delete,
            None,
        )
        .await?;
    state.core.unmount(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remount(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RemountRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/remount", Operation::Update, None)
        .await?;
    let entry = state.core.remount(&body.from, &body.to).await?;
    Ok(Json(serde_json::json!({
        "from": body.from,
        "to": entry.path,
        "uuid": entry.uuid,
    })))
}
