use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tempo_booking::HoldGrant;
use tempo_core::Slot;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<u32>,
    pub holder_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<u32>,
    pub minutes: i64,
    pub holder_id: String,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub success: bool,
    #[serde(flatten)]
    pub grant: HoldGrant,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct HoldsQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct RoomSlotsResponse {
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/holds", post(create_hold))
        .route("/v1/holds/release", post(release_hold))
        .route("/v1/holds/extend", post(extend_hold))
        .route("/v1/rooms/{room_id}/holds", get(query_holds))
}

async fn create_hold(
    State(state): State<AppState>,
    Json(req): Json<HoldRequest>,
) -> Result<Json<HoldResponse>, AppError> {
    let grant = state
        .reservations
        .acquire_hold(req.room_id, req.date, &req.slot_ids, &req.holder_id)
        .await?;
    Ok(Json(HoldResponse { success: true, grant }))
}

async fn release_hold(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let released = state
        .reservations
        .release_hold(req.room_id, req.date, &req.slot_ids)
        .await?;
    Ok(Json(ReleaseResponse { released }))
}

async fn extend_hold(
    State(state): State<AppState>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<HoldResponse>, AppError> {
    let grant = state
        .reservations
        .extend_hold(req.room_id, req.date, &req.slot_ids, req.minutes, &req.holder_id)
        .await?;
    Ok(Json(HoldResponse { success: true, grant }))
}

async fn query_holds(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HoldsQuery>,
) -> Result<Json<RoomSlotsResponse>, AppError> {
    let slots = state.reservations.query_holds(room_id, query.date).await?;
    Ok(Json(RoomSlotsResponse {
        room_id,
        date: query.date,
        slots,
    }))
}
