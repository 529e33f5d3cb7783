use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tempo_core::events::EventPublisher;
use tempo_core::repository::{BookingRepository, StoreError};
use tempo_core::{Booking, BookingStatus};
use tempo_shared::models::events::SessionStatusChangedEvent;
use tempo_shared::DomainEvent;
use tracing::{error, info, warn};

use crate::payout::PayoutDispatcher;
use crate::scheduler::ScheduledTask;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LifecycleReport {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Advances active bookings by comparing wall-clock time with their
/// session window. Idempotent, so a missed or failed tick heals on the next.
pub struct SessionLifecycleMonitor {
    bookings: Arc<dyn BookingRepository>,
    dispatcher: Arc<PayoutDispatcher>,
    publisher: Arc<dyn EventPublisher>,
    timezone: Tz,
}

impl SessionLifecycleMonitor {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        dispatcher: Arc<PayoutDispatcher>,
        publisher: Arc<dyn EventPublisher>,
        timezone: Tz,
    ) -> Self {
        Self {
            bookings,
            dispatcher,
            publisher,
            timezone,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<LifecycleReport, StoreError> {
        let mut report = LifecycleReport::default();

        for booking in self.bookings.list_active().await? {
            if let Err(e) = self.advance(booking, now, &mut report).await {
                report.failed += 1;
                error!("Lifecycle transition failed, retrying next tick: {}", e);
            }
        }

        Ok(report)
    }

    async fn advance(&self, mut booking: Booking, now: DateTime<Utc>, report: &mut LifecycleReport) -> Result<(), StoreError> {
        let Some((start, end)) = booking.session_window(&self.timezone) else {
            warn!(booking_id = %booking.id, "Booking has no resolvable session window");
            return Ok(());
        };

        if booking.status == BookingStatus::NotStarted && now >= start {
            if self
                .bookings
                .transition_status(booking.id, BookingStatus::NotStarted, BookingStatus::Ongoing, now)
                .await?
            {
                info!(booking_id = %booking.id, room_id = %booking.room_id, "Session started");
                booking.status = BookingStatus::Ongoing;
                report.started += 1;
                self.publisher
                    .publish(DomainEvent::SessionStatusChanged(SessionStatusChangedEvent {
                        booking_id: booking.id,
                        room_id: booking.room_id,
                        status: BookingStatus::Ongoing.to_string(),
                        timestamp: now.timestamp_millis(),
                    }))
                    .await;
            } else {
                // Cancelled or advanced elsewhere since it was listed
                return Ok(());
            }
        }

        if booking.status == BookingStatus::Ongoing && now >= end {
            if let Some(payout) = self.dispatcher.complete_booking(&booking, now).await? {
                info!(booking_id = %booking.id, payout_id = %payout.id, "Session completed");
                report.completed += 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ScheduledTask for SessionLifecycleMonitor {
    fn name(&self) -> &'static str {
        "session-lifecycle"
    }

    async fn run_once(&self, now: DateTime<Utc>) {
        match self.tick(now).await {
            Ok(report) if report != LifecycleReport::default() => {
                info!(
                    started = report.started,
                    completed = report.completed,
                    failed = report.failed,
                    "Lifecycle sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Failed to load active bookings: {}", e),
        }
    }
}
