//! Logical dispatch: `/v1/{mount-path}/...`.
//!
//! Everything not claimed by the `sys/` and `auth/token/` routers lands
//! here and is dispatched through the core's request pipeline. HTTP verbs
//! map onto logical operations; `?list=true` / `?scan=true` select the
//! listing operations; pagination rides on `after` / `limit` query
//! parameters.
//!
//! On a standby node the request is forwarded to the active node, unless
//! the client sent `X-Vault-No-Request-Forwarding` — then a 307 redirect
//! to the leader's `api_addr` is returned instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::{Json, Router};
use tracing::warn;

use strongbox_core::error::CoreError;
use strongbox_core::router::{Operation, Request};

use crate::NODE_ID_HEADER;
use crate::error::AppError;
use crate::middleware::{RequestMeta, TOKEN_HEADER};
use crate::state::AppState;

/// Build the logical fallback router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/{*path}",
        axum::routing::any(dispatch),
    )
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Result<HttpResponse, AppError> {
    let meta = RequestMeta::from_headers(&headers);
    let operation = map_operation(&method, &query)?;

    let mut request = Request::new(operation, path.clone());
    request.client_token.clone_from(&meta.token);
    request.namespace.clone_from(&meta.namespace);
    request.wrap_ttl = meta.wrap_ttl;
    request.data = body.map(|Json(b)| b);
    request.after = query.get("after").cloned();
    request.limit = query.get("limit").and_then(|l| l.parse().ok());

    let handled = tokio::time::timeout(
        state.request_timeout,
        state.core.handle_request(request),
    )
    .await
    .map_err(|_| AppError::Internal {
        message: "request deadline exceeded".to_owned(),
        transient: true,
    })?;

    match handled {
        Ok(response) => {
            let status = if response.data.is_none()
                && response.auth.is_none()
                && response.wrap_info.is_none()
            {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::OK
            };
            Ok((status, Json(response)).into_response())
        }
        Err(CoreError::Standby { leader }) => {
            if meta.no_forwarding {
                return Err(AppError::StandbyRedirect(leader));
            }
            let Some(leader) = leader else {
                return Err(AppError::Sealed("no active node".to_owned()));
            };
            forward_to_leader(&state, &leader, &method, &path, &query, &meta).await
        }
        Err(e) => Err(e.into()),
    }
}

/// Proxy the request to the active node and relay its response.
async fn forward_to_leader(
    state: &AppState,
    leader: &str,
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    meta: &RequestMeta,
) -> Result<HttpResponse, AppError> {
    let url = format!("{}/v1/{}", leader.trim_end_matches('/'), path);
    let mut forwarded = state
        .forward_client
        .request(method.clone(), &url)
        .query(query)
        .timeout(state.request_timeout);
    if let Some(token) = &meta.token {
        forwarded = forwarded.header(TOKEN_HEADER, token);
    }

    let upstream = forwarded.send().await.map_err(|e| {
        warn!(leader = %leader, error = %e, "request forwarding failed");
        AppError::Internal {
            message: "forwarding to the active node failed".to_owned(),
            transient: true,
        }
    })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    // The client must see which node actually serviced the request, so
    // the leader's node-id header rides along with the relayed body.
    let node_id = upstream.headers().get(NODE_ID_HEADER).cloned();
    let bytes = upstream.bytes().await.map_err(|e| AppError::Internal {
        message: format!("reading forwarded response failed: {e}"),
        transient: true,
    })?;

    let mut response = (status, bytes).into_response();
    if let Some(value) = node_id {
        response
            .headers_mut()
            .insert(axum::http::HeaderName::from_static(NODE_ID_HEADER), value);
    }
    Ok(response)
}

fn map_operation(
    method: &Method,
    query: &HashMap<String, String>,
) -> Result<Operation, AppError> {
    let truthy = |key: &str| query.get(key).is_some_and(|v| v == "true" || v == "1");

    match *method {
        Method::GET => {
            if truthy("scan") {
                Ok(Operation::Scan)
            } else if truthy("list") {
                Ok(Operation::List)
            } else {
                Ok(Operation::Read)
            }
        }
        Method::POST | Method::PUT => Ok(Operation::Create),
        Method::DELETE => Ok(Operation::Delete),
        Method::PATCH => Ok(Operation::Patch),
        _ => match method.as_str() {
            "LIST" => Ok(Operation::List),
            "SCAN" => Ok(Operation::Scan),
            other => Err(AppError::BadRequest(format!(
                "unsupported method: {other}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn verb_mapping_follows_the_protocol() {
        assert!(matches!(
            map_operation(&Method::GET, &HashMap::new()),
            Ok(Operation::Read)
        ));
        assert!(matches!(
            map_operation(&Method::GET, &query(&[("list", "true")])),
            Ok(Operation::List)
        ));
        assert!(matches!(
            map_operation(&Method::GET, &query(&[("scan", "true")])),
            Ok(Operation::Scan)
        ));
        assert!(matches!(
            map_operation(&Method::POST, &HashMap::new()),
            Ok(Operation::Create)
        ));
        assert!(matches!(
            map_operation(&Method::DELETE, &HashMap::new()),
            Ok(Operation::Delete)
        ));
        assert!(matches!(
            map_operation(&Method::PATCH, &HashMap::new()),
            Ok(Operation::Patch)
        ));
    }

    #[test]
    fn custom_list_method_is_accepted() {
        let list = Method::from_bytes(b"LIST").unwrap_or(Method::GET);
        assert!(matches!(
            map_operation(&list, &HashMap::new()),
            Ok(Operation::List)
        ));
    }
}
