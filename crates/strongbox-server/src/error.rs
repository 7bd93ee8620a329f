//! HTTP error mapping.
//!
//! Maps domain errors from `strongbox-core` onto the status taxonomy:
//! 400 malformed, 403 authentication/authorization, 404 not found, 409
//! conflict, 500 internal (transient marker for upstream failures), 503
//! sealed / no active node, 307 redirect-to-leader.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use strongbox_core::error::{
    BarrierError, CoreError, EngineError, LeaseError, MountError, PolicyError, SealError,
    TokenError,
};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Barrier sealed or node unavailable.
    Sealed(String),
    /// Standby node; redirect the client to the leader.
    StandbyRedirect(Option<String>),
    /// Authentication or authorization failed.
    Forbidden(String),
    /// Resource not found (or deliberately not listed).
    NotFound(String),
    /// Malformed request.
    BadRequest(String),
    /// Conflicting state (CAS mismatch, ceremony in progress, …).
    Conflict(String),
    /// Internal failure; `transient` marks retryable upstream errors.
    Internal { message: String, transient: bool },
}

#[derive(Serialize)]
struct ErrorBody {
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transient: Option<bool>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, transient) = match self {
            Self::Sealed(message) => (StatusCode::SERVICE_UNAVAILABLE, message, None),
            Self::StandbyRedirect(leader) => {
                let mut response = match leader {
                    Some(addr) => {
                        let location = format!("{addr}/");
                        match axum::http::HeaderValue::from_str(&location) {
                            Ok(value) => {
                                let mut r = StatusCode::TEMPORARY_REDIRECT.into_response();
                                r.headers_mut().insert(axum::http::header::LOCATION, value);
                                r
                            }
                            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
                        }
                    }
                    None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
                };
                let body = serde_json::json!({"errors": ["standby node"]});
                if let Ok(bytes) = serde_json::to_vec(&body) {
                    *response.body_mut() = axum::body::Body::from(bytes);
                }
                return response;
            }
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, message, None),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message, None),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message, None),
            Self::Conflict(message) => (StatusCode::CONFLICT, message, None),
            Self::Internal { message, transient } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, Some(transient))
            }
        };

        let body = ErrorBody {
            errors: vec![message],
            transient,
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Sealed => Self::Sealed("barrier is sealed".to_owned()),
            CoreError::Uninitialized => Self::Sealed("core is not initialized".to_owned()),
            CoreError::Standby { leader } => Self::StandbyRedirect(leader),
            CoreError::PermissionDenied { .. } | CoreError::SudoRequired { .. } => {
                Self::Forbidden(err.to_string())
            }
            CoreError::NoHandler { .. } => Self::NotFound(err.to_string()),
            CoreError::InvalidRequest { .. } => Self::BadRequest(err.to_string()),
            CoreError::Token(inner) => inner.into(),
            CoreError::Policy(inner) => inner.into(),
            CoreError::Mount(inner) => inner.into(),
            CoreError::Engine(inner) => inner.into(),
            CoreError::Barrier(inner) => inner.into(),
            CoreError::Seal(inner) => inner.into(),
            CoreError::Lease(inner) => inner.into(),
            CoreError::Audit(inner) => Self::Internal {
                message: inner.to_string(),
                transient: false,
            },
            CoreError::Internal { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound | TokenError::Expired { .. } => {
                Self::Forbidden("invalid or expired token".to_owned())
            }
            TokenError::NotRenewable
            | TokenError::MaxTtlExceeded { .. }
            | TokenError::BatchTokenUnsupported
            | TokenError::MalformedBatchToken { .. } => Self::BadRequest(err.to_string()),
            TokenError::Barrier(inner) => inner.into(),
            TokenError::Corrupt { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
        }
    }
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound { .. } => Self::NotFound(err.to_string()),
            PolicyError::Invalid { .. } => Self::BadRequest(err.to_string()),
            PolicyError::CasMismatch { .. } => Self::Conflict(err.to_string()),
            PolicyError::BuiltIn { .. }
            | PolicyError::Denied { .. }
            | PolicyError::ParameterViolation { .. } => Self::Forbidden(err.to_string()),
            PolicyError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<MountError> for AppError {
    fn from(err: MountError) -> Self {
        match err {
            MountError::PathConflict { .. } | MountError::CasMismatch { .. } => {
                Self::Conflict(err.to_string())
            }
            MountError::NotFound { .. } => Self::NotFound(err.to_string()),
            MountError::InvalidPath { .. }
            | MountError::ProtectedPath { .. }
            | MountError::UnknownEngineType { .. } => Self::BadRequest(err.to_string()),
            MountError::Corrupt { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
            MountError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { .. } => Self::NotFound(err.to_string()),
            EngineError::PermissionDenied => Self::Forbidden(err.to_string()),
            EngineError::InvalidRequest { .. }
            | EngineError::UnsupportedOperation { .. }
            | EngineError::ReadOnly => Self::BadRequest(err.to_string()),
            EngineError::Barrier(inner) => inner.into(),
            // Engine internals are typically upstream systems; mark
            // transient so clients may retry.
            EngineError::Internal { .. } => Self::Internal {
                message: err.to_string(),
                transient: true,
            },
        }
    }
}

impl From<LeaseError> for AppError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound { .. } => Self::BadRequest(err.to_string()),
            LeaseError::NotRenewable { .. } | LeaseError::Irrevocable { .. } => {
                Self::BadRequest(err.to_string())
            }
            LeaseError::RevocationFailed { .. } => Self::Internal {
                message: err.to_string(),
                transient: true,
            },
            LeaseError::Barrier(inner) => inner.into(),
            LeaseError::Corrupt { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
        }
    }
}

impl From<SealError> for AppError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::AlreadyInitialized
            | SealError::AlreadyUnsealed
            | SealError::AlreadySealed
            | SealError::InProgress { .. } => Self::Conflict(err.to_string()),
            SealError::NotInitialized
            | SealError::InvalidConfig { .. }
            | SealError::InvalidShare { .. }
            | SealError::InvalidShares
            | SealError::NonceMismatch
            | SealError::NotInProgress { .. }
            | SealError::Unsupported { .. } => Self::BadRequest(err.to_string()),
            SealError::RecoveryKeyVerification => Self::Forbidden(err.to_string()),
            SealError::MissingShamirKey
            | SealError::Wrapper { .. }
            | SealError::Crypto(_)
            | SealError::Corrupt { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
            SealError::Barrier(inner) => inner.into(),
            SealError::Storage(inner) => Self::Internal {
                message: inner.to_string(),
                transient: true,
            },
        }
    }
}

impl From<BarrierError> for AppError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed("barrier is sealed".to_owned()),
            BarrierError::AlreadyInitialized => Self::Conflict(err.to_string()),
            BarrierError::NotInitialized => Self::Sealed(err.to_string()),
            BarrierError::EntryTooLarge { .. } => Self::BadRequest(err.to_string()),
            BarrierError::UnknownTerm { .. }
            | BarrierError::Crypto(_)
            | BarrierError::Corrupt { .. }
            | BarrierError::SealWrap { .. } => Self::Internal {
                message: err.to_string(),
                transient: false,
            },
            BarrierError::Storage(inner) => Self::Internal {
                message: inner.to_string(),
                transient: true,
            },
        }
    }
}
