use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::PgPool;
use tempo_core::repository::{RoomRepository, SlotBookingMarker, StoreError};
use tempo_core::{Room, SlotTemplate};
use tempo_shared::Masked;
use uuid::Uuid;

use crate::db_err;

pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RoomRow {
    id: Uuid,
    name: String,
    owner_name: String,
    payout_destination: Option<String>,
    slots: Value,
}

#[derive(sqlx::FromRow)]
struct MarkerRow {
    slot_id: i32,
    booked_by: String,
    booking_id: Uuid,
}

pub(crate) fn parse_templates(raw: Value) -> Result<Vec<SlotTemplate>, StoreError> {
    serde_json::from_value(raw).map_err(|e| StoreError::Corrupt(format!("room slots: {}", e)))
}

impl TryFrom<RoomRow> for Room {
    type Error = StoreError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        Ok(Room {
            id: row.id,
            name: row.name,
            owner_name: row.owner_name,
            payout_destination: row.payout_destination.map(Masked),
            slots: parse_templates(row.slots)?,
        })
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let row: Option<RoomRow> = sqlx::query_as(
            "SELECT id, name, owner_name, payout_destination, slots FROM rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Room::try_from).transpose()
    }

    async fn booked_slots(&self, room_id: Uuid, date: NaiveDate) -> Result<Vec<SlotBookingMarker>, StoreError> {
        let rows: Vec<MarkerRow> = sqlx::query_as(
            r#"
            SELECT sb.slot_id, sb.booked_by, sb.booking_id
            FROM slot_bookings sb
            JOIN bookings b ON b.id = sb.booking_id
            WHERE sb.room_id = $1 AND sb.date = $2 AND b.status <> 'TERMINATED'
            ORDER BY sb.slot_id
            "#,
        )
        .bind(room_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| SlotBookingMarker {
                slot_id: r.slot_id as u32,
                booked_by: r.booked_by,
                booking_id: r.booking_id,
            })
            .collect())
    }
}
