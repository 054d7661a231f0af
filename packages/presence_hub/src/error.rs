//! HTTP error responses.
//!
//! Every handler returns `Result<_, ApiError>`; the status code and the
//! `{"error", "message"}` body are decided here in one place.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use presence_auth::{AuthError, ErrorResponse};
use tracing::error;

use crate::coordinator::PresenceError;
use crate::registry::RegistryError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    BadRequest(String),
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::AlreadyExists(_) | StoreError::AccountExists(_) => StatusCode::BAD_REQUEST,
        StoreError::Database(_) | StoreError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_code(e: &StoreError) -> &'static str {
    match e {
        StoreError::AlreadyExists(_) => "already_exists",
        StoreError::AccountExists(_) => "account_exists",
        StoreError::Database(_) | StoreError::Unavailable(_) => "store_unavailable",
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(e) if e.is_unauthorized() => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::AccountNotFound) => StatusCode::NOT_FOUND,
            Self::Auth(AuthError::Hashing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::BAD_REQUEST,
            Self::Presence(PresenceError::Store(e)) | Self::Store(e) => store_status(e),
            Self::Presence(PresenceError::Registry(RegistryError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            Self::Presence(PresenceError::Registry(RegistryError::DuplicateConnection(_))) => {
                StatusCode::CONFLICT
            }
            Self::Presence(PresenceError::Disconnected) => StatusCode::GONE,
            Self::Presence(PresenceError::EmptyField(_)) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Auth(e) => e.error_code(),
            Self::Presence(e) => e.error_code(),
            Self::Store(e) => store_code(e),
            Self::BadRequest(_) => "invalid_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        match &self {
            Self::Auth(e) => (status, Json(ErrorResponse::from(e))).into_response(),
            _ => (
                status,
                Json(serde_json::json!({
                    "error": self.code(),
                    "message": self.to_string(),
                })),
            )
                .into_response(),
        }
    }
}
