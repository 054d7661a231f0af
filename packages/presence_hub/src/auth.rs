//! Bearer-token authentication for HTTP routes and WebSocket upgrades.
//!
//! Tokens are validated once per request (or once per socket, at upgrade).
//! The subject of the token is the identity a connection is bound to.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use presence_auth::{AuthError, TokenValidator, bearer_token};

use crate::AppState;
use crate::error::ApiError;

/// Authenticated caller. Extracting it rejects the request with 401 when
/// the token is missing or invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSubject {
    pub subject_id: String,
    pub email: String,
}

/// Validate `token` and map its claims to a subject.
pub fn authenticate(validator: &dyn TokenValidator, token: &str) -> Result<AuthSubject, AuthError> {
    let claims = validator.validate(token)?;
    Ok(AuthSubject {
        subject_id: claims.sub,
        email: claims.email,
    })
}

/// The bearer token from `Authorization`, if the header is present.
/// A present header with any other scheme is malformed, not absent.
pub fn token_from_headers(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AuthError::MalformedToken("authorization header is not ASCII".into()))?;
    bearer_token(value)
        .map(Some)
        .ok_or_else(|| AuthError::MalformedToken("expected `Bearer <token>`".into()))
}

impl FromRequestParts<AppState> for AuthSubject {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(&parts.headers)?.ok_or(AuthError::MissingToken)?;
        Ok(authenticate(state.tokens.as_ref(), token)?)
    }
}
