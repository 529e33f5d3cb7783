use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};
use tempo_core::repository::{PayoutRepository, ReconciliationRepository, StoreError};
use tempo_core::{CommitFailure, Payout, PayoutStatus, ReconciliationStatus};
use tempo_shared::Masked;
use uuid::Uuid;

use crate::db_err;

const PAYOUT_COLUMNS: &str = "id, booking_id, room_id, destination, beneficiary_name, amount, currency, status, \
     retry_count, next_retry_at, reference_id, provider_transaction_id, utr, status_details, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    booking_id: Uuid,
    room_id: Uuid,
    destination: String,
    beneficiary_name: String,
    amount: i64,
    currency: String,
    status: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    reference_id: String,
    provider_transaction_id: Option<String>,
    utr: Option<String>,
    status_details: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = StoreError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<PayoutStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Payout {
            id: row.id,
            booking_id: row.booking_id,
            room_id: row.room_id,
            destination: Masked(row.destination),
            beneficiary_name: row.beneficiary_name,
            amount: row.amount,
            currency: row.currency,
            status,
            retry_count: row.retry_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            reference_id: row.reference_id,
            provider_transaction_id: row.provider_transaction_id,
            utr: row.utr,
            status_details: row.status_details,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Shared with the booking repository, which inserts the payout in the
/// same transaction that completes the booking.
pub(crate) async fn insert_payout<'e, E>(executor: E, payout: &Payout) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO payouts (id, booking_id, room_id, destination, beneficiary_name, amount, currency, status,
                             retry_count, next_retry_at, reference_id, provider_transaction_id, utr, status_details,
                             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(payout.id)
    .bind(payout.booking_id)
    .bind(payout.room_id)
    .bind(payout.destination.expose())
    .bind(&payout.beneficiary_name)
    .bind(payout.amount)
    .bind(&payout.currency)
    .bind(payout.status.as_str())
    .bind(payout.retry_count as i32)
    .bind(payout.next_retry_at)
    .bind(&payout.reference_id)
    .bind(&payout.provider_transaction_id)
    .bind(&payout.utr)
    .bind(&payout.status_details)
    .bind(payout.created_at)
    .bind(payout.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

pub struct PgPayoutRepository {
    pool: PgPool,
}

impl PgPayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, clause: &str, id: Uuid) -> Result<Vec<Payout>, StoreError> {
        let sql = format!("SELECT {} FROM payouts WHERE {} ORDER BY created_at", PAYOUT_COLUMNS, clause);
        let rows: Vec<PayoutRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(Payout::try_from).collect()
    }
}

#[async_trait]
impl PayoutRepository for PgPayoutRepository {
    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>, StoreError> {
        Ok(self.fetch_where("id = $1", id).await?.into_iter().next())
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<Payout>, StoreError> {
        Ok(self.fetch_where("booking_id = $1", booking_id).await?.into_iter().next())
    }

    async fn list_by_room(&self, room_id: Uuid) -> Result<Vec<Payout>, StoreError> {
        self.fetch_where("room_id = $1", room_id).await
    }

    async fn list_by_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>, StoreError> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!("SELECT {} FROM payouts WHERE status = ANY($1) ORDER BY created_at", PAYOUT_COLUMNS);
        let rows: Vec<PayoutRow> = sqlx::query_as(&sql)
            .bind(&wanted)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(Payout::try_from).collect()
    }

    async fn update(&self, payout: &Payout) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = $2, retry_count = $3, next_retry_at = $4, provider_transaction_id = $5,
                utr = $6, status_details = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(payout.id)
        .bind(payout.status.as_str())
        .bind(payout.retry_count as i32)
        .bind(payout.next_retry_at)
        .bind(&payout.provider_transaction_id)
        .bind(&payout.utr)
        .bind(&payout.status_details)
        .bind(payout.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("payout {}", payout.id)));
        }
        Ok(())
    }
}

pub struct PgReconciliationRepository {
    pool: PgPool,
}

impl PgReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const FAILURE_COLUMNS: &str =
    "id, payment_id, user_id, room_id, date, amount, conflicting_slots, status, refund_id, detail, created_at";

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: Uuid,
    payment_id: String,
    user_id: String,
    room_id: Uuid,
    date: NaiveDate,
    amount: i64,
    conflicting_slots: Value,
    status: String,
    refund_id: Option<String>,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl ReconciliationRepository for PgReconciliationRepository {
    async fn record(&self, failure: &CommitFailure) -> Result<(), StoreError> {
        let conflicts = serde_json::to_value(&failure.conflicting_slots)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO commit_failures (id, payment_id, user_id, room_id, date, amount, conflicting_slots,
                                         status, refund_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, refund_id = EXCLUDED.refund_id, detail = EXCLUDED.detail
            "#,
        )
        .bind(failure.id)
        .bind(&failure.payment_id)
        .bind(&failure.user_id)
        .bind(failure.room_id)
        .bind(failure.date)
        .bind(failure.amount)
        .bind(conflicts)
        .bind(failure.status.as_str())
        .bind(&failure.refund_id)
        .bind(&failure.detail)
        .bind(failure.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn find_by_payment_id(&self, payment_id: &str) -> Result<Option<CommitFailure>, StoreError> {
        let sql = format!("SELECT {} FROM commit_failures WHERE payment_id = $1 ORDER BY created_at LIMIT 1", FAILURE_COLUMNS);
        let row: Option<FailureRow> = sqlx::query_as(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(CommitFailure::try_from).transpose()
    }

    async fn list_by_status(&self, status: ReconciliationStatus) -> Result<Vec<CommitFailure>, StoreError> {
        let sql = format!("SELECT {} FROM commit_failures WHERE status = $1 ORDER BY created_at", FAILURE_COLUMNS);
        let rows: Vec<FailureRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(CommitFailure::try_from).collect()
    }
}

impl TryFrom<FailureRow> for CommitFailure {
    type Error = StoreError;

    fn try_from(row: FailureRow) -> Result<Self, Self::Error> {
        Ok(CommitFailure {
            id: row.id,
            payment_id: row.payment_id,
            user_id: row.user_id,
            room_id: row.room_id,
            date: row.date,
            amount: row.amount,
            conflicting_slots: serde_json::from_value(row.conflicting_slots)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: row
                .status
                .parse::<ReconciliationStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            refund_id: row.refund_id,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}
