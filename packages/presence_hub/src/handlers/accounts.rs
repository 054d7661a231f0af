//! Signup and login. Both answer with a bearer token.

use axum::{Json, extract::State, http::StatusCode};
use presence_auth::{AuthError, hash_password, verify_password};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use crate::store::StoreError;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    fn normalized_email(&self) -> Result<String, ApiError> {
        let email = self.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(ApiError::BadRequest("a valid email is required".into()));
        }
        if self.password.is_empty() {
            return Err(ApiError::BadRequest("password must not be empty".into()));
        }
        Ok(email)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn signup_handler(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let email = body.normalized_email()?;
    if state.accounts.find_account_by_email(&email).await?.is_some() {
        return Err(AuthError::AccountExists.into());
    }

    let hash = hash_password(&body.password)?;
    let account = state
        .accounts
        .create_account(&email, &hash)
        .await
        .map_err(|e| match e {
            StoreError::AccountExists(_) => ApiError::Auth(AuthError::AccountExists),
            other => other.into(),
        })?;

    let token = state.tokens.issue(&account.id, &account.email)?;
    info!(account = %account.id, "account created");
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Json<TokenResponse>, ApiError> {
    let email = body.normalized_email()?;
    let account = state
        .accounts
        .find_account_by_email(&email)
        .await?
        .ok_or(AuthError::AccountNotFound)?;

    if !verify_password(&body.password, &account.password_hash)? {
        return Err(AuthError::InvalidCredentials.into());
    }

    let token = state.tokens.issue(&account.id, &account.email)?;
    Ok(Json(TokenResponse { token }))
}
