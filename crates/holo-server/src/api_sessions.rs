//! Session lifecycle and history endpoints.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use holo_link::LinkError;
use holo_session::{DeviceAttachment, SessionError, SessionSnapshot};
use holo_types::{ParticipantId, SessionId, Turn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("quota exceeded: {0}")]
    TooManyRequests(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::SessionNotFound(_) => ApiError::NotFound(message),
            SessionError::SessionClosed(_) => ApiError::Conflict(message),
            SessionError::QuotaExceeded { .. } => ApiError::TooManyRequests(message),
            SessionError::UnknownParticipant(_) | SessionError::InvalidRequest(_) => {
                ApiError::BadRequest(message)
            }
            SessionError::DeviceUnreachable => ApiError::Unavailable(message),
            SessionError::Link(link) => link.into(),
            SessionError::AdapterTimeout(_)
            | SessionError::AdapterFailure(_)
            | SessionError::Store(_) => ApiError::InternalServerError(message),
        }
    }
}

impl From<LinkError> for ApiError {
    fn from(err: LinkError) -> Self {
        let message = err.to_string();
        match err {
            LinkError::LinkNotFound(_) => ApiError::NotFound(message),
            LinkError::InvalidToken => ApiError::Unauthorized(message),
            LinkError::InvalidResumePoint { .. } => ApiError::Unprocessable(message),
            LinkError::Closed => ApiError::Conflict(message),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub companion_id: String,
    /// The first participant owns the session.
    pub participants: Vec<ParticipantId>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTextRequest {
    pub participant_id: ParticipantId,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachDeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteTurnsResponse {
    pub deleted: usize,
}

/// Handler for `POST /api/sessions`.
pub async fn create_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let snapshot = state
        .orchestrator
        .start_session(&payload.companion_id, payload.participants)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// Handler for `GET /api/sessions`.
pub async fn list_sessions_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<SessionSnapshot>> {
    Json(state.orchestrator.list_sessions().await)
}

/// Handler for `GET /api/sessions/{id}`.
pub async fn get_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.snapshot(session_id).await?))
}

/// Handler for `DELETE /api/sessions/{id}`.
pub async fn end_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.end_session(session_id).await?))
}

/// Handler for `POST /api/sessions/{id}/heartbeat`.
pub async fn heartbeat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.heartbeat(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/sessions/{id}/text`.
pub async fn submit_text_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(payload): Json<SubmitTextRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .submit_text(session_id, &payload.participant_id, &payload.text)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// Handler for `POST /api/sessions/{id}/devices`.
///
/// The returned link id and token are what the device presents on
/// `/ws/links/{link_id}`.
pub async fn attach_device_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(payload): Json<AttachDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceAttachment>), ApiError> {
    if payload.device_id.trim().is_empty() {
        return Err(ApiError::BadRequest("device_id is empty".to_string()));
    }
    let attachment = state
        .orchestrator
        .attach_device(session_id, payload.device_id)
        .await?;
    tracing::info!(
        session_id = %session_id,
        link_id = %attachment.link_id,
        "device attached"
    );
    Ok((StatusCode::CREATED, Json(attachment)))
}

/// Handler for `GET /api/sessions/{id}/turns`.
pub async fn list_turns_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    Ok(Json(state.orchestrator.list_turns(session_id).await?))
}

/// Handler for `DELETE /api/sessions/{id}/turns`.
pub async fn delete_turns_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<DeleteTurnsResponse>, ApiError> {
    let deleted = state.orchestrator.delete_turns(session_id).await?;
    Ok(Json(DeleteTurnsResponse { deleted }))
}

/// Handler for `GET /api/sessions/{id}/export`.
pub async fn export_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.orchestrator.export_session(session_id).await?))
}
