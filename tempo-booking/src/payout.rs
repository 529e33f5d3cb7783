use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempo_core::events::EventPublisher;
use tempo_core::payment::{PayoutInstruction, PayoutProvider};
use tempo_core::repository::{BookingRepository, PayoutRepository, RoomRepository, StoreError};
use tempo_core::{Booking, BookingStatus, Payout, PayoutStatus};
use tempo_shared::models::events::{PayoutStatusChangedEvent, SessionStatusChangedEvent};
use tempo_shared::{DomainEvent, Masked};
use tempo_store::app_config::BusinessRules;
use tracing::{debug, error, info, warn};

use crate::scheduler::ScheduledTask;

/// `base * 2^(attempt - 1)`, never more than `cap`.
pub fn retry_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let factor = 1i32 << exponent;
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

/// Creates the payout of a completed booking and talks to the provider.
pub struct PayoutDispatcher {
    bookings: Arc<dyn BookingRepository>,
    payouts: Arc<dyn PayoutRepository>,
    rooms: Arc<dyn RoomRepository>,
    provider: Arc<dyn PayoutProvider>,
    publisher: Arc<dyn EventPublisher>,
    currency: String,
    purpose: String,
}

impl PayoutDispatcher {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        payouts: Arc<dyn PayoutRepository>,
        rooms: Arc<dyn RoomRepository>,
        provider: Arc<dyn PayoutProvider>,
        publisher: Arc<dyn EventPublisher>,
        rules: &BusinessRules,
    ) -> Self {
        Self {
            bookings,
            payouts,
            rooms,
            provider,
            publisher,
            currency: rules.currency.clone(),
            purpose: rules.payout_purpose.clone(),
        }
    }

    /// Moves an ONGOING booking to COMPLETED together with its payout row,
    /// then submits the payout.
    ///
    /// Returns `None` when the booking had already left ONGOING, in which
    /// case nothing is written and nothing is paid.
    pub async fn complete_booking(&self, booking: &Booking, now: DateTime<Utc>) -> Result<Option<Payout>, StoreError> {
        let room = self.rooms.get_room(booking.room_id).await?;
        let (destination, beneficiary) = match &room {
            Some(r) => (r.payout_destination.clone(), r.owner_name.clone()),
            None => (None, String::new()),
        };

        let mut payout = Payout::for_booking(
            booking,
            destination.clone().unwrap_or_else(|| Masked(String::new())),
            beneficiary,
            &self.currency,
            now,
        );
        if destination.is_none() {
            payout.mark_failed("Room has no payout destination".to_string(), now, now);
        }

        if !self.bookings.complete_with_payout(booking.id, &payout, now).await? {
            debug!(booking_id = %booking.id, "Booking already left ONGOING, skipping payout");
            return Ok(None);
        }

        info!(
            booking_id = %booking.id,
            payout_id = %payout.id,
            "Booking completed, payout {} of {} {} created",
            payout.reference_id,
            payout.amount,
            payout.currency
        );
        self.publisher
            .publish(DomainEvent::SessionStatusChanged(SessionStatusChangedEvent {
                booking_id: booking.id,
                room_id: booking.room_id,
                status: BookingStatus::Completed.to_string(),
                timestamp: now.timestamp_millis(),
            }))
            .await;

        if payout.status == PayoutStatus::Pending {
            self.submit(&mut payout, now).await;
        } else {
            warn!(payout_id = %payout.id, "Payout created without destination, left for retry");
            self.announce(&payout, now).await;
        }

        Ok(Some(payout))
    }

    /// Sends `payout` to the provider under its fixed reference, then persists
    /// and broadcasts the outcome. Returns the resulting status.
    pub async fn submit(&self, payout: &mut Payout, now: DateTime<Utc>) -> PayoutStatus {
        let instruction = PayoutInstruction {
            reference_id: payout.reference_id.clone(),
            amount: payout.amount,
            destination: payout.destination.clone(),
            beneficiary_name: payout.beneficiary_name.clone(),
            purpose: self.purpose.clone(),
        };

        match self.provider.initiate_payout(&instruction).await {
            Ok(accepted) => {
                payout.status = PayoutStatus::from_provider(&accepted.status);
                payout.provider_transaction_id = Some(accepted.transaction_id);
                payout.utr = accepted.utr.or(payout.utr.take());
                payout.status_details = accepted.description;
                payout.next_retry_at = (payout.status == PayoutStatus::Failed).then_some(now);
                payout.updated_at = now;
                info!(
                    payout_id = %payout.id,
                    "Payout {} to {} submitted, provider status {}",
                    payout.reference_id,
                    payout.destination,
                    payout.status
                );
            }
            Err(e) => {
                warn!(payout_id = %payout.id, "Payout {} submission failed: {}", payout.reference_id, e);
                payout.mark_failed(e.to_string(), now, now);
            }
        }

        self.persist(payout, now).await;
        payout.status
    }

    async fn persist(&self, payout: &Payout, now: DateTime<Utc>) {
        if let Err(e) = self.payouts.update(payout).await {
            error!(payout_id = %payout.id, "Failed to persist payout: {}", e);
            return;
        }
        self.announce(payout, now).await;
    }

    async fn announce(&self, payout: &Payout, now: DateTime<Utc>) {
        self.publisher
            .publish(DomainEvent::PayoutStatusChanged(PayoutStatusChangedEvent {
                payout_id: payout.id,
                booking_id: payout.booking_id,
                room_id: payout.room_id,
                status: payout.status.to_string(),
                details: payout.status_details.clone(),
                timestamp: now.timestamp_millis(),
            }))
            .await;
    }

    async fn refresh_destination(&self, payout: &mut Payout) -> Result<bool, StoreError> {
        if !payout.destination.expose().is_empty() {
            return Ok(true);
        }
        let room = self.rooms.get_room(payout.room_id).await?;
        match room.and_then(|r| r.payout_destination.map(|d| (d, r.owner_name))) {
            Some((destination, owner)) => {
                payout.destination = destination;
                payout.beneficiary_name = owner;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PayoutReport {
    pub synced: usize,
    pub retried: usize,
    pub exhausted: usize,
}

/// Polls in-flight payouts and resubmits failed ones with bounded attempts.
pub struct PayoutRetryMonitor {
    payouts: Arc<dyn PayoutRepository>,
    provider: Arc<dyn PayoutProvider>,
    dispatcher: Arc<PayoutDispatcher>,
    max_retry_attempts: u32,
    backoff: Duration,
    backoff_cap: Duration,
}

impl PayoutRetryMonitor {
    pub fn new(
        payouts: Arc<dyn PayoutRepository>,
        provider: Arc<dyn PayoutProvider>,
        dispatcher: Arc<PayoutDispatcher>,
        rules: &BusinessRules,
    ) -> Self {
        Self {
            payouts,
            provider,
            dispatcher,
            max_retry_attempts: rules.max_retry_attempts,
            backoff: Duration::seconds(rules.retry_backoff_seconds as i64),
            backoff_cap: Duration::seconds(rules.retry_backoff_cap_seconds as i64),
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> PayoutReport {
        let mut report = PayoutReport::default();
        self.sync_statuses(now, &mut report).await;
        self.retry_failed(now, &mut report).await;
        report
    }

    /// Pull provider status for every in-flight payout.
    pub async fn sync_statuses(&self, now: DateTime<Utc>, report: &mut PayoutReport) {
        let in_flight = match self.payouts.list_by_status(&PayoutStatus::IN_FLIGHT).await {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to list in-flight payouts: {}", e);
                return;
            }
        };

        for mut payout in in_flight {
            let Some(transaction_id) = payout.provider_transaction_id.clone() else {
                // Row committed but never submitted
                info!(payout_id = %payout.id, "Submitting payout {} found without transaction id", payout.reference_id);
                self.dispatcher.submit(&mut payout, now).await;
                report.synced += 1;
                continue;
            };

            let remote = match self.provider.fetch_status(&transaction_id).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(payout_id = %payout.id, "Status fetch for {} failed: {}", transaction_id, e);
                    continue;
                }
            };

            let status = PayoutStatus::from_provider(&remote.status);
            let utr = remote.utr.or(payout.utr.clone());
            if status == payout.status && utr == payout.utr {
                continue;
            }

            info!(payout_id = %payout.id, "Payout {} moved {} -> {}", payout.reference_id, payout.status, status);
            payout.status = status;
            payout.utr = utr;
            if remote.description.is_some() {
                payout.status_details = remote.description;
            }
            if status == PayoutStatus::Failed {
                payout.next_retry_at = Some(now);
            }
            payout.updated_at = now;
            self.dispatcher.persist(&payout, now).await;
            report.synced += 1;
        }
    }

    /// Resubmit FAILED payouts whose retry time has come.
    pub async fn retry_failed(&self, now: DateTime<Utc>, report: &mut PayoutReport) {
        let failed = match self.payouts.list_by_status(&[PayoutStatus::Failed]).await {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to list failed payouts: {}", e);
                return;
            }
        };

        for mut payout in failed {
            if payout.next_retry_at.is_some_and(|at| at > now) {
                continue;
            }

            if payout.retry_count >= self.max_retry_attempts {
                self.exhaust(&mut payout, now).await;
                report.exhausted += 1;
                continue;
            }

            payout.retry_count += 1;
            report.retried += 1;
            info!(
                payout_id = %payout.id,
                "Retrying payout {} (attempt {}/{})",
                payout.reference_id,
                payout.retry_count,
                self.max_retry_attempts
            );

            let status = match self.dispatcher.refresh_destination(&mut payout).await {
                Ok(true) => self.dispatcher.submit(&mut payout, now).await,
                Ok(false) => {
                    payout.mark_failed("Room has no payout destination".to_string(), now, now);
                    PayoutStatus::Failed
                }
                Err(e) => {
                    warn!(payout_id = %payout.id, "Failed to load room for payout: {}", e);
                    payout.mark_failed(e.to_string(), now, now);
                    PayoutStatus::Failed
                }
            };

            if status != PayoutStatus::Failed {
                continue;
            }

            if payout.retry_count >= self.max_retry_attempts {
                self.exhaust(&mut payout, now).await;
                report.exhausted += 1;
            } else {
                let wait = retry_backoff(self.backoff, self.backoff_cap, payout.retry_count);
                payout.next_retry_at = Some(now + wait);
                payout.updated_at = now;
                if let Err(e) = self.payouts.update(&payout).await {
                    error!(payout_id = %payout.id, "Failed to schedule payout retry: {}", e);
                }
            }
        }
    }

    async fn exhaust(&self, payout: &mut Payout, now: DateTime<Utc>) {
        error!(
            payout_id = %payout.id,
            booking_id = %payout.booking_id,
            "Payout {} reached {} attempts, manual action required",
            payout.reference_id,
            payout.retry_count
        );
        payout.status = PayoutStatus::MaxRetriesReached;
        payout.next_retry_at = None;
        payout.updated_at = now;
        self.dispatcher.persist(payout, now).await;
    }
}

#[async_trait]
impl ScheduledTask for PayoutRetryMonitor {
    fn name(&self) -> &'static str {
        "payout-retry"
    }

    async fn run_once(&self, now: DateTime<Utc>) {
        let report = self.tick(now).await;
        if report != PayoutReport::default() {
            info!(
                synced = report.synced,
                retried = report.retried,
                exhausted = report.exhausted,
                "Payout sweep finished"
            );
        }
    }
}
