//! HTTP boundary. Status codes are assigned here and nowhere else.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::db::RepositoryError;
use crate::error::{ErrorKind, ServiceError};
use crate::services::storage::StorageError;

pub mod conversions;
pub mod health;
pub mod images;
pub mod metrics;

/// Header carrying the authenticated caller, set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("missing or malformed x-user-id header")]
    MissingCaller,

    #[error("{0}")]
    BadRequest(String),
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        ApiError::Service(e.into())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Service(e.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Service(e) => {
                let status = status_for(e.kind());
                if status.is_server_error() {
                    tracing::error!(error = %e, "Request failed");
                    (status, status.canonical_reason().unwrap_or("error").to_string())
                } else {
                    (status, e.to_string())
                }
            }
            ApiError::MissingCaller => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// The caller's user id, taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Caller)
            .ok_or(ApiError::MissingCaller)
    }
}
