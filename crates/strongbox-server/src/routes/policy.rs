//! Policy routes: `/v1/sys/policies/acl/*`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use strongbox_core::policy::{PathRule, Policy};
use strongbox_core::router::Operation;

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::routes::sys::require_token;
use crate::state::AppState;

/// Build the `/v1/sys/policies` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/acl", get(list))
        .route(
            "/acl/{name}",
            get(read).put(write).post(write).delete(delete),
        )
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    paths: Vec<PathRule>,
    #[serde(default)]
    cas: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CasQuery {
    #[serde(default)]
    cas: Option<u64>,
}

async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "sys/policies/acl", Operation::List, None)
        .await?;
    let names = state.core.policies().list().await?;
    Ok(Json(serde_json::json!({ "keys": names })))
}

async fn read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(
            token,
            &format!("sys/policies/acl/{name}"),
            Operation::Read,
            None,
        )
        .await?;
    let policy = state.core.policies().get(&name).await?;
    Ok(Json(policy))
}

async fn write(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<CasQuery>,
    Json(body): Json<WriteRequest>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(
            token,
            &format!("sys/policies/acl/{name}"),
            Operation::Update,
            None,
        )
        .await?;

    let policy = Policy {
        name,
        paths: body.paths,
        cas_version: 0,
    };
    state
        .core
        .policies()
        .put(&policy, body.cas.or(query.cas))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(
            token,
            &format!("sys/policies/acl/{name}"),
            Operation::Delete,
            None,
        )
        .await?;
    state.core.policies().delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
