use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use tempo_core::booking::validate_commit;
use tempo_core::repository::{BookingRepository, CommitOutcome, StoreError};
use tempo_core::{Booking, BookingStatus, CommitRequest, HoldSnapshot, Payout, Slot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db_err;
use crate::payout_repo::insert_payout;
use crate::room_repo::parse_templates;

const BOOKING_COLUMNS: &str =
    "id, user_id, room_id, date, slots, status, total_amount, payment_id, refund, created_at, updated_at";

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: String,
    room_id: Uuid,
    date: NaiveDate,
    slots: Value,
    status: String,
    total_amount: i64,
    payment_id: String,
    refund: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = move |e: serde_json::Error| StoreError::Corrupt(format!("booking {}: {}", id, e));
        Ok(Booking {
            id,
            user_id: row.user_id,
            room_id: row.room_id,
            date: row.date,
            slots: serde_json::from_value(row.slots).map_err(corrupt)?,
            status: row
                .status
                .parse::<BookingStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            total_amount: row.total_amount,
            payment_id: row.payment_id,
            refund: row.refund.map(serde_json::from_value).transpose().map_err(corrupt)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

async fn fetch_by_payment(conn: &mut PgConnection, payment_id: &str) -> Result<Option<Booking>, StoreError> {
    let sql = format!("SELECT {} FROM bookings WHERE payment_id = $1", BOOKING_COLUMNS);
    let row: Option<BookingRow> = sqlx::query_as(&sql)
        .bind(payment_id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;

    row.map(Booking::try_from).transpose()
}

/// Constraint name of a unique violation, if `err` is one.
fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn commit_booking(
        &self,
        request: &CommitRequest,
        holds: &HoldSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialise commits per (room, date)
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}|{}", request.room_id, request.date))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(existing) = fetch_by_payment(&mut tx, &request.payment_id).await? {
            return Ok(CommitOutcome::Duplicate(existing));
        }

        // Slots of terminated bookings are free again
        sqlx::query(
            r#"
            DELETE FROM slot_bookings sb
            USING bookings b
            WHERE sb.booking_id = b.id AND sb.room_id = $1 AND sb.date = $2 AND b.status = 'TERMINATED'
            "#,
        )
        .bind(request.room_id)
        .bind(request.date)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let templates: Option<Value> = sqlx::query_scalar("SELECT slots FROM rooms WHERE id = $1")
            .bind(request.room_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(templates) = templates else {
            return Ok(CommitOutcome::Conflict(request.slot_ids()));
        };
        let templates = parse_templates(templates)?;

        let markers: Vec<(i32, String)> =
            sqlx::query_as("SELECT slot_id, booked_by FROM slot_bookings WHERE room_id = $1 AND date = $2")
                .bind(request.room_id)
                .bind(request.date)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        let booked: HashMap<u32, String> = markers.into_iter().map(|(id, by)| (id as u32, by)).collect();

        let slots: Vec<Slot> = templates
            .iter()
            .map(|t| Slot::from_template(t, booked.get(&t.slot_id).cloned()).with_hold(holds.get(&t.slot_id)))
            .collect();

        if let Err(conflicts) = validate_commit(&slots, request, now) {
            return Ok(CommitOutcome::Conflict(conflicts));
        }

        let booking = Booking::from_commit(request, now);
        let slots_json = serde_json::to_value(&booking.slots).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bookings (id, user_id, room_id, date, slots, status, total_amount, payment_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.user_id)
        .bind(booking.room_id)
        .bind(booking.date)
        .bind(slots_json)
        .bind(booking.status.as_str())
        .bind(booking.total_amount)
        .bind(&booking.payment_id)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if unique_violation(&e).is_some() {
                drop(tx);
                // Same payment committed concurrently for another room/date
                let mut conn = self.pool.acquire().await.map_err(db_err)?;
                if let Some(existing) = fetch_by_payment(&mut conn, &request.payment_id).await? {
                    return Ok(CommitOutcome::Duplicate(existing));
                }
            }
            return Err(db_err(e));
        }

        for slot in &booking.slots {
            let marked = sqlx::query(
                "INSERT INTO slot_bookings (room_id, date, slot_id, booking_id, booked_by) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(booking.room_id)
            .bind(booking.date)
            .bind(slot.slot_id as i32)
            .bind(booking.id)
            .bind(&booking.user_id)
            .execute(&mut *tx)
            .await;

            if let Err(e) = marked {
                if unique_violation(&e).is_some() {
                    warn!("Slot {} already marked booked while committing {}", slot.slot_id, booking.payment_id);
                    return Ok(CommitOutcome::Conflict(vec![slot.slot_id]));
                }
                return Err(db_err(e));
            }
        }

        tx.commit().await.map_err(db_err)?;
        info!("Booking {} committed for payment {}", booking.id, booking.payment_id);
        Ok(CommitOutcome::Committed(booking))
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let sql = format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS);
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Booking>, StoreError> {
        let sql = format!(
            "SELECT {} FROM bookings WHERE status IN ('NOT_STARTED', 'ONGOING') ORDER BY date, created_at",
            BOOKING_COLUMNS
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await.map_err(db_err)?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        let result = sqlx::query("UPDATE bookings SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_with_payout(&self, id: Uuid, payout: &Payout, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query("UPDATE bookings SET status = 'COMPLETED', updated_at = $2 WHERE id = $1 AND status = 'ONGOING'")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if let Err(e) = insert_payout(&mut *tx, payout).await {
            if unique_violation(&e).is_some() {
                warn!("Payout for booking {} already exists", id);
                return Ok(false);
            }
            return Err(db_err(e));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}
