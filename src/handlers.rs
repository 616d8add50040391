use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::assigner::WaitEstimator;
use crate::db::{QueueStore, StoreError};
use crate::model::{EntryStatus, NotificationState, QueueEntry};
use crate::service::{CheckInError, CheckInService};
use crate::status::{ClinicStatus, StatusProjector};
use crate::validation::{CheckInRequest, FieldError, ValidationErrors};

#[derive(Clone)]
pub struct AppState {
    pub checkin: CheckInService,
    pub projector: StatusProjector,
    pub store: QueueStore,
    pub estimator: Arc<dyn WaitEstimator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/check-in", post(check_in))
        .route("/queue/status", get(queue_status))
        .route("/queue/entries/{id}", get(entry_view))
        .route("/queue/entries/{id}/status", post(update_entry_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationErrors),
    NotFound(i64),
    Conflict(String),
    /// Infrastructure failure; the message is what the client sees.
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(errs) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid input", "details": errs.fields() }),
            ),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("queue entry {id} not found") }),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(id),
            StoreError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            other => {
                error!(error = ?other, "queue storage failed");
                ApiError::Internal("Queue unavailable")
            }
        }
    }
}

impl From<CheckInError> for ApiError {
    fn from(err: CheckInError) -> Self {
        match err {
            CheckInError::Validation(errs) => ApiError::Validation(errs),
            CheckInError::Storage(err) => {
                error!(error = ?err, "check-in error");
                ApiError::Internal("Check-in failed")
            }
        }
    }
}

fn malformed_body(rejection: JsonRejection) -> ApiError {
    ApiError::Validation(ValidationErrors(vec![FieldError {
        field: "body",
        message: rejection.body_text(),
    }]))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckInResponse {
    success: bool,
    entry_id: i64,
    queue_number: u32,
    estimated_wait: u32,
    patients_ahead: u32,
    timestamp: DateTime<Utc>,
}

#[instrument(skip_all)]
async fn check_in(
    State(state): State<AppState>,
    body: Result<Json<CheckInRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CheckInResponse>), ApiError> {
    let Json(request) = body.map_err(malformed_body)?;
    let receipt = state.checkin.check_in(&request).await?;
    info!(id = receipt.id, position = receipt.position, "patient checked in");
    Ok((
        StatusCode::CREATED,
        Json(CheckInResponse {
            success: true,
            entry_id: receipt.id,
            queue_number: receipt.position,
            estimated_wait: receipt.estimated_wait_minutes,
            patients_ahead: receipt.patients_ahead,
            timestamp: receipt.timestamp,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueStatusResponse {
    current_wait_time: u32,
    queue_length: u32,
    clinic_status: ClinicStatus,
}

async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatusResponse>, ApiError> {
    let status = state.projector.current_status().await?;
    Ok(Json(QueueStatusResponse {
        current_wait_time: status.average_wait_minutes,
        queue_length: status.queue_length,
        clinic_status: status.clinic_status,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryResponse {
    id: i64,
    status: EntryStatus,
    position: Option<u32>,
    patients_ahead: Option<u32>,
    estimated_wait: Option<u32>,
    notification_state: NotificationState,
}

async fn entry_response(state: &AppState, entry: QueueEntry) -> Result<EntryResponse, ApiError> {
    let position = state.store.position_of(entry.id).await?;
    let patients_ahead = position.map(|p| p - 1);
    Ok(EntryResponse {
        id: entry.id,
        status: entry.status,
        position,
        patients_ahead,
        estimated_wait: patients_ahead.map(|n| state.estimator.estimate_minutes(n)),
        notification_state: entry.notification_state,
    })
}

async fn entry_view(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<EntryResponse>, ApiError> {
    let entry = state.store.get(id).await?;
    Ok(Json(entry_response(&state, entry).await?))
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: EntryStatus,
}

#[instrument(skip_all)]
async fn update_entry_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Result<Json<StatusChange>, JsonRejection>,
) -> Result<Json<EntryResponse>, ApiError> {
    let Json(change) = body.map_err(malformed_body)?;
    let entry = state.store.update_status(id, change.status).await?;
    info!(id, status = entry.status.as_str(), "entry status updated");
    Ok(Json(entry_response(&state, entry).await?))
}
