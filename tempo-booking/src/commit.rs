use std::sync::Arc;
use tempo_core::events::EventPublisher;
use tempo_core::payment::PayoutProvider;
use tempo_core::repository::{BookingRepository, CommitOutcome, ReconciliationRepository, StoreError};
use tempo_core::{Booking, Clock, CommitFailure, CommitRequest, ReconciliationStatus};
use tempo_shared::models::events::CommitFailedEvent;
use tempo_shared::DomainEvent;
use tracing::{error, info, warn};

use crate::reservation::ReservationStore;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Invalid commit request: {0}")]
    Invalid(String),
    /// Payment was captured but the slots could not be secured.
    #[error("Slots {slots:?} could not be booked (refunded: {refunded})")]
    Conflict { slots: Vec<u32>, refunded: bool },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns captured payments into bookings.
///
/// Safe under redelivery: a payment that already produced a booking returns
/// that booking, and one that already failed returns the recorded conflict.
pub struct BookingCommitWorker {
    reservations: Arc<ReservationStore>,
    bookings: Arc<dyn BookingRepository>,
    reconciliation: Arc<dyn ReconciliationRepository>,
    provider: Arc<dyn PayoutProvider>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl BookingCommitWorker {
    pub fn new(
        reservations: Arc<ReservationStore>,
        bookings: Arc<dyn BookingRepository>,
        reconciliation: Arc<dyn ReconciliationRepository>,
        provider: Arc<dyn PayoutProvider>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reservations,
            bookings,
            reconciliation,
            provider,
            publisher,
            clock,
        }
    }

    pub async fn commit(&self, request: &CommitRequest) -> Result<Booking, CommitError> {
        request.validate().map_err(|e| CommitError::Invalid(e.to_string()))?;

        if let Some(failure) = self.reconciliation.find_by_payment_id(&request.payment_id).await? {
            info!("Payment {} already failed to commit, not retrying", request.payment_id);
            return Err(CommitError::Conflict {
                slots: failure.conflicting_slots,
                refunded: failure.status == ReconciliationStatus::Refunded,
            });
        }

        let now = self.clock.now();
        let holds = self.reservations.snapshot(request.room_id, request.date);
        let slot_ids = request.slot_ids();

        match self.bookings.commit_booking(request, &holds, now).await? {
            CommitOutcome::Committed(booking) => {
                info!(
                    booking_id = %booking.id,
                    room_id = %booking.room_id,
                    date = %booking.date,
                    "Committed payment {} for slots {:?}",
                    booking.payment_id,
                    slot_ids
                );
                self.reservations
                    .convert(request.room_id, request.date, &slot_ids, &request.user_id)
                    .await;
                Ok(booking)
            }
            CommitOutcome::Duplicate(booking) => {
                info!(booking_id = %booking.id, "Payment {} was already committed", request.payment_id);
                Ok(booking)
            }
            CommitOutcome::Conflict(conflicts) => Err(self.compensate(request, conflicts).await),
        }
    }

    /// Release the requester's holds, record the failure and try to refund.
    async fn compensate(&self, request: &CommitRequest, conflicts: Vec<u32>) -> CommitError {
        let now = self.clock.now();
        error!(
            room_id = %request.room_id,
            date = %request.date,
            user_id = %request.user_id,
            "Payment {} captured but slots {:?} are unavailable",
            request.payment_id,
            conflicts
        );

        self.reservations
            .release_owned(request.room_id, request.date, &request.slot_ids(), &request.user_id)
            .await;

        // No refund without a ledger entry to dedupe redeliveries against
        let mut failure = CommitFailure::new(request, conflicts.clone(), now);
        if let Err(e) = self.reconciliation.record(&failure).await {
            error!("Failed to record commit failure for payment {}: {}", request.payment_id, e);
            return CommitError::Store(e);
        }

        match self
            .provider
            .refund(&request.payment_id, request.amount, "Slot unavailable at booking time")
            .await
        {
            Ok(receipt) => {
                info!("Refunded payment {} as {}", request.payment_id, receipt.refund_id);
                failure.status = ReconciliationStatus::Refunded;
                failure.refund_id = Some(receipt.refund_id);
            }
            Err(e) => {
                error!("Refund of payment {} failed, left for manual review: {}", request.payment_id, e);
                failure.detail = Some(e.to_string());
            }
        }

        if let Err(e) = self.reconciliation.record(&failure).await {
            warn!("Failed to update commit failure {}: {}", failure.id, e);
        }

        let refunded = failure.status == ReconciliationStatus::Refunded;
        self.publisher
            .publish(DomainEvent::CommitFailed(CommitFailedEvent {
                payment_id: request.payment_id.clone(),
                user_id: request.user_id.clone(),
                room_id: request.room_id,
                date: request.date,
                conflicting_slots: conflicts.clone(),
                refunded,
                timestamp: now.timestamp_millis(),
            }))
            .await;

        CommitError::Conflict {
            slots: conflicts,
            refunded,
        }
    }
}
