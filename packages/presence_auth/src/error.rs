//! Error types, error codes, and machine-actionable recovery hints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Obtain a fresh token via login.
    Login,
    /// Create an account first.
    Signup,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recovery {
    #[serde(flatten)]
    pub action: RecoveryAction,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account already exists")]
    AccountExists,

    #[error("account not found")]
    AccountNotFound,

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

impl AuthError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken(_) => "malformed_token",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountExists => "account_exists",
            Self::AccountNotFound => "account_not_found",
            Self::Hashing(_) => "hashing_failed",
        }
    }

    /// Whether this error means "reject the connection or request as unauthenticated".
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::MissingToken | Self::MalformedToken(_) | Self::InvalidSignature | Self::Expired
        )
    }

    pub fn recovery(&self) -> Recovery {
        let action = match self {
            Self::MissingToken | Self::InvalidSignature | Self::Expired => RecoveryAction::Login,
            Self::MalformedToken(_) => RecoveryAction::Login,
            Self::AccountNotFound => RecoveryAction::Signup,
            Self::InvalidCredentials | Self::AccountExists | Self::Hashing(_) => {
                RecoveryAction::None
            }
        };
        Recovery { action }
    }
}

/// Serializable error response for HTTP bodies and WebSocket close reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub recovery: Recovery,
}

impl From<&AuthError> for ErrorResponse {
    fn from(err: &AuthError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            recovery: err.recovery(),
        }
    }
}
