//! Token auth routes: `/v1/auth/token/*`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;

use strongbox_core::router::{Auth, Operation, Response};
use strongbox_core::token::{CreateTokenParams, TokenEntry, TokenType};

use crate::error::AppError;
use crate::middleware::RequestMeta;
use crate::routes::sys::require_token;
use crate::state::AppState;

/// Build the `/v1/auth/token` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/create", put(create).post(create))
        .route("/create-orphan", put(create_orphan).post(create_orphan))
        .route("/lookup-self", axum::routing::get(lookup_self))
        .route("/lookup", put(lookup).post(lookup))
        .route("/lookup-accessor", put(lookup_accessor).post(lookup_accessor))
        .route("/renew-self", put(renew_self).post(renew_self))
        .route("/renew", put(renew).post(renew))
        .route("/revoke-self", put(revoke_self).post(revoke_self))
        .route("/revoke", put(revoke).post(revoke))
        .route("/revoke-orphan", put(revoke_orphan).post(revoke_orphan))
}

#[derive(Debug, Default, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    ttl: Option<i64>,
    #[serde(default)]
    explicit_max_ttl: Option<i64>,
    #[serde(default)]
    period: Option<i64>,
    #[serde(default)]
    no_parent: bool,
    #[serde(default)]
    renewable: Option<bool>,
    #[serde(default)]
    meta: HashMap<String, String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    bound_cidrs: Vec<String>,
    #[serde(default, rename = "type")]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenTarget {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    accessor: Option<String>,
    #[serde(default)]
    increment: Option<i64>,
}

fn auth_block(token: String, entry: &TokenEntry) -> Response {
    Response {
        auth: Some(Auth {
            client_token: token,
            accessor: entry.accessor.clone(),
            policies: entry.policies.clone(),
            lease_duration: entry.ttl_secs,
            renewable: entry.renewable,
            entity_id: entry.entity_id.clone(),
            token_type: match entry.token_type {
                TokenType::Service => "service".to_owned(),
                TokenType::Batch => "batch".to_owned(),
            },
        }),
        ..Response::default()
    }
}

fn token_data(entry: &TokenEntry) -> Response {
    Response::ok(serde_json::json!({
        "accessor": entry.accessor,
        "policies": entry.policies,
        "ttl": entry.ttl_secs,
        "explicit_max_ttl": entry.explicit_max_ttl_secs,
        "creation_time": entry.creation_time.to_rfc3339(),
        "expire_time": entry.expires_at().map(|t| t.to_rfc3339()),
        "entity_id": entry.entity_id,
        "orphan": entry.orphan,
        "period": entry.period_secs,
        "type": match entry.token_type {
            TokenType::Service => "service",
            TokenType::Batch => "batch",
        },
        "display_name": entry.display_name,
        "meta": entry.meta,
    }))
}

async fn create_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: CreateRequest,
    orphan: bool,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(headers);
    let token = require_token(&meta)?;
    let acl_path = if orphan {
        "auth/token/create-orphan"
    } else {
        "auth/token/create"
    };
    state
        .core
        .authorize_token(token, acl_path, Operation::Update, None)
        .await?;

    // Batch tokens are a separate, stateless issuance path.
    if body.token_type.as_deref() == Some("batch") {
        let batch = state
            .core
            .tokens()
            .create_batch(
                body.policies.clone(),
                body.entity_id.clone(),
                body.ttl.unwrap_or(3600),
                body.meta.clone(),
            )
            .await?;
        let entry = state.core.tokens().lookup(&batch).await?;
        return Ok(Json(auth_block(batch, &entry)));
    }

    let params = CreateTokenParams {
        policies: body.policies,
        ttl_secs: body.ttl.unwrap_or(0),
        explicit_max_ttl_secs: body.explicit_max_ttl.unwrap_or(0),
        parent_hash: None,
        orphan: orphan || body.no_parent,
        period_secs: body.period,
        entity_id: body.entity_id,
        meta: body.meta,
        bound_cidrs: body.bound_cidrs,
        renewable: body.renewable.unwrap_or(true),
        display_name: body.display_name.unwrap_or_else(|| "token".to_owned()),
    };
    let (new_token, entry) = state.core.create_token(token, params).await?;
    Ok(Json(auth_block(new_token, &entry)))
}

async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateRequest>>,
) -> Result<Json<Response>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    create_inner(&state, &headers, body, false).await
}

async fn create_orphan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateRequest>>,
) -> Result<Json<Response>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    create_inner(&state, &headers, body, true).await
}

async fn lookup_self(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    let entry = state
        .core
        .authorize_token(token, "auth/token/lookup-self", Operation::Read, None)
        .await?;
    Ok(Json(token_data(&entry)))
}

async fn lookup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenTarget>,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/lookup", Operation::Update, None)
        .await?;
    let target = body
        .token
        .ok_or_else(|| AppError::BadRequest("missing 'token'".to_owned()))?;
    let entry = state.core.tokens().lookup(&target).await?;
    Ok(Json(token_data(&entry)))
}

async fn lookup_accessor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenTarget>,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/lookup-accessor", Operation::Update, None)
        .await?;
    let accessor = body
        .accessor
        .ok_or_else(|| AppError::BadRequest("missing 'accessor'".to_owned()))?;
    let entry = state.core.tokens().lookup_by_accessor(&accessor).await?;
    Ok(Json(token_data(&entry)))
}

async fn renew_self(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<TokenTarget>>,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/renew-self", Operation::Update, None)
        .await?;
    let increment = body.and_then(|Json(b)| b.increment).unwrap_or(3600);
    let entry = state.core.renew_token(token, increment).await?;
    Ok(Json(auth_block(token.to_owned(), &entry)))
}

async fn renew(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenTarget>,
) -> Result<Json<Response>, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/renew", Operation::Update, None)
        .await?;
    let target = body
        .token
        .ok_or_else(|| AppError::BadRequest("missing 'token'".to_owned()))?;
    let entry = state
        .core
        .renew_token(&target, body.increment.unwrap_or(3600))
        .await?;
    Ok(Json(auth_block(target, &entry)))
}

async fn revoke_self(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/revoke-self", Operation::Update, None)
        .await?;
    state.core.revoke_token(token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenTarget>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/revoke", Operation::Update, None)
        .await?;
    let target = body
        .token
        .ok_or_else(|| AppError::BadRequest("missing 'token'".to_owned()))?;
    state.core.revoke_token(&target).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_orphan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenTarget>,
) -> Result<StatusCode, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let token = require_token(&meta)?;
    state
        .core
        .authorize_token(token, "auth/token/revoke-orphan", Operation::Update, None)
        .await?;
    let target = body
        .token
        .ok_or_else(|| AppError::BadRequest("missing 'token'".to_owned()))?;
    state.core.tokens().revoke_orphan(&target).await?;
    Ok(StatusCode::NO_CONTENT)
}
