//! Audit device routes: `/v1/sys/audit/*`.
//!
//! Lists, enables, and disables audit devices at runtime. These paths sit
//! behind `sudo`: turning off auditing is as sensitive as sealing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use strongbox_core::audit::AuditDeviceEntry;
use strongbox_core::router::Operation;

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::routes::sys::require_token;
use crate::state::AppState;

/// Build the `/v1/sys/audit` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audit", get(list))
        .route("/audit/{name}", put(enable).post(enable).delete(disable))
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    #[serde(rename = "type")]
    sink_type: String,
    #[serde(default)]
    options: HashMap<String, String>,
    #[serde(default)]
    blocking: bool,
}

async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/audit", Operation::Read, None)
        .await?;

    // Persisted records carry the full options; devices registered only
    // at startup (config-file sinks) are listed without them.
    let persisted = state.core.list_audit_devices().await?;
    let mut data = serde_json::Map::new();
    for entry in &persisted {
        data.insert(
            format!("{}/", entry.name),
            serde_json::json!({
                "type": entry.sink_type,
                "options": entry.options,
                "blocking": entry.blocking,
            }),
        );
    }
    for device in state.core.registered_audit_devices().await {
        data.entry(format!("{}/", device.name)).or_insert_with(|| {
            serde_json::json!({
                "type": device.sink_type,
                "options": {},
                "blocking": device.blocking,
            })
        });
    }
    Ok(Json(serde_json::Value::Object(data)))
}

async fn enable(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<EnableRequest>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, &format!("sys/audit/{name}"), Operation::Update, None)
        .await?;

    state
        .core
        .enable_audit_device(AuditDeviceEntry {
            name,
            sink_type: body.sink_type,
            options: body.options,
            blocking: body.blocking,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, &format!("sys/audit/{name}"), Operation::Delete, None)
        .await?;

    state.core.disable_audit_device(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
