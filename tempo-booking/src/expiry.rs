use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempo_core::channel::{DelayedActionChannel, Delivery};
use tempo_core::ExpiryAction;
use tracing::{error, info, warn};

use crate::reservation::ReservationStore;
use crate::scheduler::ScheduledTask;

#[derive(Debug, thiserror::Error)]
#[error("Expiry handling failed: {0}")]
pub struct ExpiryError(pub String);

/// Consumer side of a compensating expiry action.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    /// Release what the action still covers. Must be idempotent.
    async fn on_expired(&self, action: &ExpiryAction, now: DateTime<Utc>) -> Result<Vec<u32>, ExpiryError>;
}

#[async_trait]
impl ExpiryHandler for ReservationStore {
    async fn on_expired(&self, action: &ExpiryAction, now: DateTime<Utc>) -> Result<Vec<u32>, ExpiryError> {
        Ok(self.expire(action, now).await)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpiryReport {
    pub handled: usize,
    pub released: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub recovered: usize,
}

/// Drains due expiry actions from the delayed channel, retrying failed
/// handling and routing exhausted actions to the recovery path.
pub struct ReservationExpiryPipeline {
    channel: Arc<dyn DelayedActionChannel>,
    handler: Arc<dyn ExpiryHandler>,
    reservations: Option<Arc<ReservationStore>>,
    max_deliveries: u32,
    retry_delay: Duration,
    batch_size: usize,
}

impl ReservationExpiryPipeline {
    pub fn new(channel: Arc<dyn DelayedActionChannel>, reservations: Arc<ReservationStore>, max_deliveries: u32) -> Self {
        Self {
            channel,
            handler: reservations.clone(),
            reservations: Some(reservations),
            max_deliveries: max_deliveries.max(1),
            retry_delay: Duration::seconds(5),
            batch_size: 100,
        }
    }

    /// Pipeline over an arbitrary handler; nothing is pruned.
    pub fn with_handler(channel: Arc<dyn DelayedActionChannel>, handler: Arc<dyn ExpiryHandler>, max_deliveries: u32) -> Self {
        Self {
            channel,
            handler,
            reservations: None,
            max_deliveries: max_deliveries.max(1),
            retry_delay: Duration::seconds(5),
            batch_size: 100,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Claim and handle every action due at `now`.
    pub async fn process_due(&self, now: DateTime<Utc>, report: &mut ExpiryReport) {
        let deliveries = match self.channel.claim_due(now, self.batch_size).await {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to claim expiry actions: {}", e);
                return;
            }
        };

        for delivery in deliveries {
            self.handle(&delivery, now, report).await;
        }
    }

    async fn handle(&self, delivery: &Delivery, now: DateTime<Utc>, report: &mut ExpiryReport) {
        let action_id = delivery.action.action_id;

        // Claimed too often without an ack
        if delivery.attempts > self.max_deliveries {
            self.bury(delivery, "delivery attempts exhausted", report).await;
            return;
        }

        match self.handler.on_expired(&delivery.action, now).await {
            Ok(released) => {
                report.handled += 1;
                report.released += released.len();
                if let Err(e) = self.channel.ack(delivery).await {
                    // Redelivered after the claim lapses; handling is idempotent
                    warn!("Failed to ack expiry action {}: {}", action_id, e);
                }
            }
            Err(e) if delivery.attempts >= self.max_deliveries => {
                self.bury(delivery, &e.to_string(), report).await;
            }
            Err(e) => {
                warn!("Expiry action {} failed (attempt {}): {}", action_id, delivery.attempts, e);
                let backoff = self.retry_delay * delivery.attempts as i32;
                match self.channel.retry(delivery, now + backoff).await {
                    Ok(()) => report.retried += 1,
                    Err(e) => error!("Failed to reschedule expiry action {}: {}", action_id, e),
                }
            }
        }
    }

    async fn bury(&self, delivery: &Delivery, reason: &str, report: &mut ExpiryReport) {
        match self.channel.dead_letter(delivery, reason).await {
            Ok(()) => report.dead_lettered += 1,
            Err(e) => error!("Failed to dead-letter expiry action {}: {}", delivery.action.action_id, e),
        }
    }

    /// Recovery consumer: force-release whatever dead-lettered actions
    /// still cover.
    pub async fn drain_recovery(&self, now: DateTime<Utc>, report: &mut ExpiryReport) {
        let letters = match self.channel.drain_dead_letters(self.batch_size).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to drain expiry dead letters: {}", e);
                return;
            }
        };

        for letter in letters {
            let Some(action) = letter.action else {
                error!("Dropping undecodable expiry action ({}): {}", letter.reason, letter.raw);
                continue;
            };

            match self.handler.on_expired(&action, now).await {
                Ok(released) => {
                    report.recovered += 1;
                    warn!(
                        room_id = %action.room_id,
                        date = %action.date,
                        holder = %action.holder_id,
                        "Recovered dead-lettered expiry action {} after {} attempts ({}); released {:?}",
                        action.action_id,
                        letter.attempts,
                        letter.reason,
                        released
                    );
                }
                Err(e) => {
                    // Expired holds are unusable regardless; prune reclaims them
                    error!("Recovery of expiry action {} failed: {}", action.action_id, e);
                }
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> ExpiryReport {
        let mut report = ExpiryReport::default();
        self.process_due(now, &mut report).await;
        self.drain_recovery(now, &mut report).await;

        if let Some(reservations) = &self.reservations {
            let pruned = reservations.prune(now);
            if pruned > 0 {
                info!("Pruned {} stale holds", pruned);
            }
        }
        report
    }
}

#[async_trait]
impl ScheduledTask for ReservationExpiryPipeline {
    fn name(&self) -> &'static str {
        "reservation-expiry"
    }

    async fn run_once(&self, now: DateTime<Utc>) {
        let report = self.tick(now).await;
        if report != ExpiryReport::default() {
            info!(
                handled = report.handled,
                released = report.released,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                recovered = report.recovered,
                "Expiry tick"
            );
        }
    }
}
