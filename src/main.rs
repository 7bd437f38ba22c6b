use std::sync::Arc;

use tracing::{error, info, warn};

use lapse::audit::AuditLog;
use lapse::clock::SystemClock;
use lapse::config::Config;
use lapse::expiration::ExpirationEngine;
use lapse::inventory::{NoopInventory, RetryingInventory};
use lapse::lifecycle::BookingLifecycle;
use lapse::model::Trigger;
use lapse::notify::NotifyHub;
use lapse::scheduler::{run_scheduler, Scheduler, TriggerError};
use lapse::store::{run_compactor, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    lapse::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("lapse.wal");

    let store = Arc::new(Store::open(wal_path.clone(), Arc::new(NotifyHub::new()))?);
    let lifecycle = BookingLifecycle::new(store.clone(), Arc::new(SystemClock));
    let inventory = RetryingInventory::new(
        NoopInventory,
        config.release_attempts,
        config.release_backoff,
    );
    let engine = ExpirationEngine::new(lifecycle, AuditLog::new(store.clone()), Arc::new(inventory));
    let scheduler = Arc::new(Scheduler::new(Arc::new(engine)));

    info!("lapse started");
    info!("  wal: {}", wal_path.display());
    info!("  run interval: {}s", config.run_interval.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::spawn(run_scheduler(scheduler.clone(), config.run_interval));
    tokio::spawn(run_compactor(
        store.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sigusr1.recv() => manual_run(&scheduler).await,
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received");
    store.close().await;
    info!("lapse stopped");
    Ok(())
}

/// SIGUSR1: the administrative "run now".
#[cfg_attr(not(unix), allow(dead_code))]
async fn manual_run(scheduler: &Scheduler) {
    match scheduler.trigger(Trigger::Manual).await {
        Ok(Some(report)) => info!(
            "manual run: {} candidates, {} expired, {} skipped, {} errors",
            report.candidates,
            report.processed.len(),
            report.skipped.len(),
            report.errors.len()
        ),
        Ok(None) => {}
        Err(TriggerError::Busy) => warn!("manual run refused: a run is already in progress"),
        Err(e) => error!("manual run failed: {e}"),
    }
}
