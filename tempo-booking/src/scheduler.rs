use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempo_core::Clock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, Instrument};

/// A background job driven on a fixed period.
///
/// `run_once` receives the current time so tests can drive it with a
/// virtual clock instead of sleeping.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self, now: DateTime<Utc>);
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    tasks: Vec<(Arc<dyn ScheduledTask>, Duration)>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, tasks: Vec::new() }
    }

    pub fn every(mut self, period: Duration, task: Arc<dyn ScheduledTask>) -> Self {
        self.tasks.push((task, period));
        self
    }

    /// Spawn one loop per task. A tick that overruns its period skips the
    /// ticks it missed.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.tasks
            .into_iter()
            .map(|(task, period)| {
                let clock = self.clock.clone();
                let span = tracing::info_span!("scheduled_task", task = task.name());
                tokio::spawn(
                    async move {
                        info!("Started, period {:?}", period);
                        let mut interval = tokio::time::interval(period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        loop {
                            interval.tick().await;
                            let now = clock.now();
                            debug!("Tick at {}", now);
                            task.run_once(now).await;
                        }
                    }
                    .instrument(span),
                )
            })
            .collect()
    }
}
