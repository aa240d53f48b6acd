use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use crate::intake::{IngestionState, IntakeError, IntakeRequest, IntakeStatus};

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub ingestion_id: Uuid,
    pub state: IngestionState,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = match self {
            IntakeError::UnknownLibrary(_) | IntakeError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            IntakeError::DownloadFailed { .. }
            | IntakeError::CommitFailed(_)
            | IntakeError::Aborted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, self.to_string())
    }
}

pub async fn submit_intake(
    State(state): State<AppState>,
    body: Result<Json<IntakeRequest>, JsonRejection>,
) -> Response {
    // Any unreadable body is a 422, syntax errors included
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
        }
    };

    match state.intake.submit(request) {
        Ok(handle) => (
            StatusCode::CREATED,
            Json(SubmitResponse {
                ingestion_id: handle.id,
                state: handle.state,
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn intake_status(State(state): State<AppState>) -> Json<IntakeStatus> {
    Json(state.intake.status())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
