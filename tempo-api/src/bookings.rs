use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tempo_core::{Booking, CommitRequest};
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub status: &'static str,
    pub payment_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings/commit", post(commit_booking))
        .route("/v1/bookings/commit/queue", post(enqueue_commit))
        .route("/v1/bookings/{id}", get(get_booking))
}

/// Runs the commit inline. Only called once the payment has been captured.
async fn commit_booking(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<Booking>, AppError> {
    let booking = state.commit_worker.commit(&req).await?;
    Ok(Json(booking))
}

/// Hands the commit to the Kafka-backed worker.
async fn enqueue_commit(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    req.validate()
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    let queue = state
        .commit_queue
        .as_ref()
        .ok_or_else(|| AppError::Unavailable("Commit queue is not configured".to_string()))?;

    queue.submit_commit(&req).await.map_err(anyhow::Error::from)?;
    info!("Queued commit for payment {}", req.payment_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            status: "QUEUED",
            payment_id: req.payment_id,
        }),
    ))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    state
        .bookings
        .get_booking(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFoundError(format!("Booking {} not found", id)))
}
