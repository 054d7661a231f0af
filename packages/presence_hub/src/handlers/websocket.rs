use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use presence_auth::AuthError;
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::auth::{authenticate, token_from_headers};
use crate::error::ApiError;
use crate::ws;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Browsers cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

/// Upgrade to a presence socket. The token is checked once, here; a missing
/// or invalid token is refused with 401 before the upgrade.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match token_from_headers(&headers) {
        Ok(token) => token.or(params.token.as_deref()),
        Err(e) => return ApiError::from(e).into_response(),
    };

    let subject = match token
        .ok_or(AuthError::MissingToken)
        .and_then(|token| authenticate(state.tokens.as_ref(), token))
    {
        Ok(subject) => subject.subject_id,
        Err(e) => {
            debug!(error = %e, "websocket upgrade refused");
            return ApiError::from(e).into_response();
        }
    };

    let coordinator = state.coordinator.clone();
    let metrics = state.metrics.clone();
    let send_capacity = state.ws_config.send_capacity;

    ws.on_upgrade(move |socket| {
        ws::handle_socket(socket, coordinator, metrics, subject, send_capacity)
    })
}
