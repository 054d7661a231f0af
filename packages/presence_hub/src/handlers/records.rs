//! Per-subject data records and HTTP status updates. Every route here
//! requires a bearer token; the subject is always the token's.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthSubject;
use crate::error::ApiError;
use crate::store::StatusRecord;

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

pub async fn create_record_handler(
    State(state): State<AppState>,
    subject: AuthSubject,
    Json(body): Json<CreateRecordRequest>,
) -> Result<(StatusCode, Json<StatusRecord>), ApiError> {
    let record = state
        .coordinator
        .create_record(&subject.subject_id, &body.content)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_records_handler(
    State(state): State<AppState>,
    subject: AuthSubject,
) -> Result<Json<Vec<StatusRecord>>, ApiError> {
    Ok(Json(state.coordinator.records_for(&subject.subject_id).await?))
}

pub async fn update_status_handler(
    State(state): State<AppState>,
    subject: AuthSubject,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<StatusRecord>, ApiError> {
    let record = state
        .coordinator
        .update_status(&subject.subject_id, &body.status)
        .await?;
    Ok(Json(record))
}
