use std::net::SocketAddr;

// ── Expiration runs ─────────────────────────────────────────────

/// Counter: expiration passes. Labels: trigger, outcome (completed, disabled, failed, busy).
pub const RUNS_TOTAL: &str = "lapse_expiration_runs_total";

/// Histogram: wall time of one pass in seconds. Labels: trigger.
pub const RUN_DURATION_SECONDS: &str = "lapse_expiration_run_duration_seconds";

/// Counter: bookings claimed, logged and removed.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "lapse_bookings_expired_total";

/// Counter: claims lost to a concurrent run.
pub const CLAIMS_LOST_TOTAL: &str = "lapse_claims_lost_total";

/// Counter: per-booking failures. Labels: stage.
pub const BOOKING_FAILURES_TOTAL: &str = "lapse_booking_failures_total";

/// Counter: inventory releases that still failed after retries.
pub const RELEASE_FAILURES_TOTAL: &str = "lapse_inventory_release_failures_total";

/// Gauge: bookings due to lapse within the stats window.
pub const UPCOMING_EXPIRATIONS: &str = "lapse_upcoming_expirations";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: lifecycle transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "lapse_booking_transitions_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: log group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lapse_wal_flush_duration_seconds";

/// Histogram: log group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lapse_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
