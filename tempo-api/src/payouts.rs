use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempo_core::Payout;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Payout as shown to clients. The destination is masked.
#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub room_id: Uuid,
    pub destination: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub reference_id: String,
    pub provider_transaction_id: Option<String>,
    pub utr: Option<String>,
    pub status_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payout> for PayoutResponse {
    fn from(p: Payout) -> Self {
        Self {
            id: p.id,
            booking_id: p.booking_id,
            room_id: p.room_id,
            destination: p.destination.to_string(),
            amount: p.amount,
            currency: p.currency,
            status: p.status.to_string(),
            retry_count: p.retry_count,
            next_retry_at: p.next_retry_at,
            reference_id: p.reference_id,
            provider_transaction_id: p.provider_transaction_id,
            utr: p.utr,
            status_details: p.status_details,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payouts/{id}", get(get_payout))
        .route("/v1/rooms/{room_id}/payouts", get(list_room_payouts))
}

async fn get_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PayoutResponse>, AppError> {
    state
        .payouts
        .get_payout(id)
        .await?
        .map(|p| Json(p.into()))
        .ok_or_else(|| AppError::NotFoundError(format!("Payout {} not found", id)))
}

async fn list_room_payouts(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<Vec<PayoutResponse>>, AppError> {
    let payouts = state.payouts.list_by_room(room_id).await?;
    Ok(Json(payouts.into_iter().map(PayoutResponse::from).collect()))
}
