
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::audit::AuditLog;
use crate::error::CoreError;
use crate::inventory::Inventory;
use crate::lifecycle::{BookingLifecycle, Claim};
use crate::limits::STATS_WINDOW_MS;
use crate::model::*;
use crate::observability as obs;

pub const EXPIRATION_REASON: &str = "payment not completed within the expiration window";

/// Where in the per-booking pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Claim,
    Audit,
    Delete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Claim => "claim",
            Stage::Audit => "audit",
            Stage::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredBooking {
    pub booking_id: Ulid,
    pub reference: String,
    pub log_id: Ulid,
    /// The booking is gone either way; a stale hold may remain on the calendar.
    pub release_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run claimed it first.
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedBooking {
    pub booking_id: Ulid,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFailure {
    pub booking_id: Ulid,
    pub stage: Stage,
    pub error: String,
}

/// Per-booking outcomes of one pass. Every candidate appears in exactly one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub trigger: Trigger,
    /// The single instant the whole batch was judged against.
    pub now: Ms,
    pub policy_disabled: bool,
    pub candidates: usize,
    pub processed: Vec<ExpiredBooking>,
    pub skipped: Vec<SkippedBooking>,
    pub errors: Vec<BookingFailure>,
}

impl RunReport {
    fn new(trigger: Trigger, now: Ms) -> Self {
        Self {
            trigger,
            now,
            policy_disabled: false,
            candidates: 0,
            processed: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationStats {
    /// Entries in the expiration log.
    pub total: usize,
    /// Expired within the last stats window.
    pub recent: usize,
    /// Due to lapse within the next stats window.
    pub upcoming: usize,
    pub policy: ExpirationPolicy,
    pub last_run_at: Option<Ms>,
}

/// The window a booking was actually given, falling back to the current policy.
fn frozen_hours(b: &Booking, policy_hours: ExpirationHours) -> u32 {
    match (b.owner_confirmed_at, b.expires_at) {
        (Some(confirmed), Some(expires)) if expires > confirmed => {
            u32::try_from((expires - confirmed) / HOUR_MS).unwrap_or(policy_hours.hours())
        }
        _ => policy_hours.hours(),
    }
}

fn log_entry(
    before: &Booking,
    policy_hours: ExpirationHours,
    now: Ms,
    trigger: Trigger,
) -> Result<ExpirationLogEntry, serde_json::Error> {
    Ok(ExpirationLogEntry {
        id: Ulid::new(),
        booking_id: before.id,
        booking_reference: before.reference.clone(),
        owner_id: before.owner_id,
        renter_id: before.renter_id,
        product_id: before.product_id,
        product_title: before.product_title.clone(),
        booking_created_at: before.created_at,
        expires_at: before.expires_at,
        expiration_hours: frozen_hours(before, policy_hours),
        total_amount: before.total_amount,
        snapshot: serde_json::to_string(before)?,
        reason: EXPIRATION_REASON.to_string(),
        expired_at: now,
        expired_by: trigger,
    })
}

/// One cleanup pass: find due bookings, then claim, log, release and delete
/// each in turn. A failure on one booking is reported and the pass moves on.
pub struct ExpirationEngine {
    lifecycle: BookingLifecycle,
    audit: AuditLog,
    inventory: Arc<dyn Inventory>,
}

impl ExpirationEngine {
    pub fn new(lifecycle: BookingLifecycle, audit: AuditLog, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            lifecycle,
            audit,
            inventory,
        }
    }

    pub fn lifecycle(&self) -> &BookingLifecycle {
        &self.lifecycle
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn run(&self, trigger: Trigger) -> Result<RunReport, CoreError> {
        let now = self.lifecycle.clock().now();
        self.run_at(trigger, now).await
    }

    /// Only a failure to read the candidate list fails the whole pass.
    pub async fn run_at(&self, trigger: Trigger, now: Ms) -> Result<RunReport, CoreError> {
        let started = Instant::now();
        let settings = self.lifecycle.settings();
        let policy = settings.get_policy().await;
        if !policy.enabled {
            info!("{} expiration run skipped: policy disabled", trigger.as_str());
            metrics::counter!(obs::RUNS_TOTAL, "trigger" => trigger.as_str(), "outcome" => "disabled")
                .increment(1);
            let mut report = RunReport::new(trigger, now);
            report.policy_disabled = true;
            return Ok(report);
        }

        let candidates = match self.lifecycle.repository().find_expiration_candidates(now).await {
            Ok(c) => c,
            Err(e) => {
                error!("{} expiration run aborted: {e}", trigger.as_str());
                metrics::counter!(obs::RUNS_TOTAL, "trigger" => trigger.as_str(), "outcome" => "failed")
                    .increment(1);
                return Err(e);
            }
        };

        let report = self
            .expire_candidates(trigger, now, policy.expiration_hours, candidates)
            .await;
        settings.record_run(now).await;

        metrics::counter!(obs::RUNS_TOTAL, "trigger" => trigger.as_str(), "outcome" => "completed")
            .increment(1);
        metrics::histogram!(obs::RUN_DURATION_SECONDS, "trigger" => trigger.as_str())
            .record(started.elapsed().as_secs_f64());
        if report.candidates > 0 {
            info!(
                "{} expiration run: {} candidates, {} expired, {} skipped, {} errors",
                trigger.as_str(),
                report.candidates,
                report.processed.len(),
                report.skipped.len(),
                report.errors.len()
            );
        } else {
            debug!("{} expiration run: nothing due", trigger.as_str());
        }
        Ok(report)
    }

    /// Process an already-read candidate snapshot, sequentially and in order.
    pub async fn expire_candidates(
        &self,
        trigger: Trigger,
        now: Ms,
        policy_hours: ExpirationHours,
        candidates: Vec<Booking>,
    ) -> RunReport {
        let mut report = RunReport::new(trigger, now);
        report.candidates = candidates.len();
        for candidate in &candidates {
            self.expire_one(trigger, now, policy_hours, candidate, &mut report)
                .await;
        }
        report
    }

    async fn expire_one(
        &self,
        trigger: Trigger,
        now: Ms,
        policy_hours: ExpirationHours,
        candidate: &Booking,
        report: &mut RunReport,
    ) {
        let id = candidate.id;
        let fail = |report: &mut RunReport, stage: Stage, error: String| {
            warn!("expiring booking {id} failed at {}: {error}", stage.as_str());
            metrics::counter!(obs::BOOKING_FAILURES_TOTAL, "stage" => stage.as_str()).increment(1);
            report.errors.push(BookingFailure {
                booking_id: id,
                stage,
                error,
            });
        };

        let before = match self.lifecycle.claim_for_expiration(id, now, trigger).await {
            Ok(Claim::Claimed(before)) => before,
            Ok(Claim::AlreadyClaimed) => {
                debug!("booking {id} already claimed elsewhere");
                metrics::counter!(obs::CLAIMS_LOST_TOTAL).increment(1);
                report.skipped.push(SkippedBooking {
                    booking_id: id,
                    reason: SkipReason::AlreadyClaimed,
                });
                return;
            }
            Err(e) => return fail(report, Stage::Claim, e.to_string()),
        };

        // From here on the row is claimed and inert; a failure leaves it so.
        let entry = match log_entry(&before, policy_hours, now, trigger) {
            Ok(entry) => entry,
            Err(e) => return fail(report, Stage::Audit, e.to_string()),
        };
        let log_id = entry.id;
        if let Err(e) = self.audit.record(entry).await {
            return fail(report, Stage::Audit, e.to_string());
        }

        let release_error = match self.inventory.release(before.product_id, before.rental).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "booking {id}: could not release product {} hold: {e}",
                    before.product_id
                );
                metrics::counter!(obs::RELEASE_FAILURES_TOTAL).increment(1);
                Some(e.to_string())
            }
        };

        if let Err(e) = self.lifecycle.repository().delete_cascade(&id).await {
            return fail(report, Stage::Delete, e.to_string());
        }

        metrics::counter!(obs::BOOKINGS_EXPIRED_TOTAL).increment(1);
        info!(
            "booking {id} ({}) expired: unpaid since {:?}",
            before.reference, before.expires_at
        );
        report.processed.push(ExpiredBooking {
            booking_id: id,
            reference: before.reference,
            log_id,
            release_error,
        });
    }

    /// Counts for the administrative dashboard.
    pub async fn stats(&self) -> ExpirationStats {
        let now = self.lifecycle.clock().now();
        let policy = self.lifecycle.settings().get_policy().await;
        let upcoming = self
            .lifecycle
            .repository()
            .find_upcoming(now, STATS_WINDOW_MS)
            .await
            .len();
        metrics::gauge!(obs::UPCOMING_EXPIRATIONS).set(upcoming as f64);
        ExpirationStats {
            total: self.audit.len().await,
            recent: self.audit.count_since(now - STATS_WINDOW_MS).await,
            upcoming,
            last_run_at: policy.last_run_at,
            policy,
        }
    }
}
