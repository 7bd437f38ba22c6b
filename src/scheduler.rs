use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::expiration::{ExpirationEngine, RunReport};
use crate::model::Trigger;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("an expiration run is already in progress")]
    Busy,
    #[error("expiration run failed: {0}")]
    Run(#[from] CoreError),
}

/// Serializes expiration passes within this process. The run lock is held
/// for a whole pass, so overlapping triggers never interleave.
pub struct Scheduler {
    engine: Arc<ExpirationEngine>,
    run_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(engine: Arc<ExpirationEngine>) -> Self {
        Self {
            engine,
            run_lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<ExpirationEngine> {
        &self.engine
    }

    /// Start a pass unless one is already running. A busy manual trigger is
    /// refused with `Busy`; a busy scheduled trigger is skipped (`Ok(None)`).
    pub async fn trigger(&self, source: Trigger) -> Result<Option<RunReport>, TriggerError> {
        let _running = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => match source {
                Trigger::Manual => return Err(TriggerError::Busy),
                Trigger::Scheduled => {
                    debug!("scheduled tick skipped: a run is in progress");
                    return Ok(None);
                }
            },
        };
        let report = self.engine.run(source).await?;
        Ok(Some(report))
    }
}

/// Fire a scheduled pass every `period`. A failed pass is retried on the next tick.
pub async fn run_scheduler(scheduler: Arc<Scheduler>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("expiration scheduler started, period {}s", period.as_secs());
    loop {
        interval.tick().await;
        match scheduler.trigger(Trigger::Scheduled).await {
            Ok(Some(report)) if !report.is_clean() => {
                warn!(
                    "scheduled run left {} booking(s) in error",
                    report.errors.len()
                );
            }
            Ok(_) => {}
            Err(e) => warn!("scheduled run failed, retrying next tick: {e}"),
        }
    }
}
