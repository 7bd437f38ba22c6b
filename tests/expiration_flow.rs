use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use lapse::audit::{AuditLog, LogFilter, Pagination, Purge};
use lapse::clock::{Clock, ManualClock};
use lapse::error::CoreError;
use lapse::expiration::ExpirationEngine;
use lapse::inventory::{NoopInventory, RetryingInventory};
use lapse::lifecycle::BookingLifecycle;
use lapse::model::*;
use lapse::notify::NotifyHub;
use lapse::scheduler::{Scheduler, TriggerError};
use lapse::store::Store;

// ── Test infrastructure ──────────────────────────────────────

const T0: Ms = 1_700_000_000_000;

struct Service {
    store: Arc<Store>,
    notify: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    scheduler: Arc<Scheduler>,
}

fn start(dir: &std::path::Path) -> Service {
    let notify = Arc::new(NotifyHub::new());
    let store = Arc::new(Store::open(dir.join("lapse.wal"), notify.clone()).unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let lifecycle = BookingLifecycle::new(store.clone(), clock.clone());
    let inventory = RetryingInventory::new(NoopInventory, 3, Duration::from_millis(1));
    let engine = ExpirationEngine::new(lifecycle, AuditLog::new(store.clone()), Arc::new(inventory));
    Service {
        store,
        notify,
        clock,
        scheduler: Arc::new(Scheduler::new(Arc::new(engine))),
    }
}

fn temp_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("lapse_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

impl Service {
    fn lifecycle(&self) -> &BookingLifecycle {
        self.scheduler.engine().lifecycle()
    }

    fn audit(&self) -> &AuditLog {
        self.scheduler.engine().audit()
    }

    async fn book(&self, renter: Ulid, owner: Ulid, reference: &str) -> Booking {
        self.lifecycle()
            .create(NewBooking {
                id: Ulid::new(),
                reference: reference.into(),
                renter_id: renter,
                owner_id: owner,
                product_id: Ulid::new(),
                product_title: "Kayak".into(),
                rental: DateRange::new(T0 + 72 * HOUR_MS, T0 + 96 * HOUR_MS),
                total_amount: 9_900,
            })
            .await
            .unwrap()
    }
}

// ── Flows ────────────────────────────────────────────────────

#[tokio::test]
async fn unpaid_booking_lapses_and_parties_hear_about_it() {
    let svc = start(&temp_dir());
    let (renter, owner) = (Ulid::new(), Ulid::new());
    let mut renter_rx = svc.notify.subscribe(renter);
    let mut owner_rx = svc.notify.subscribe(owner);

    let b = svc.book(renter, owner, "BK-1001").await;
    svc.lifecycle().confirm_by_owner(b.id, owner).await.unwrap();

    svc.clock.advance(HOUR_MS);
    let early = svc.scheduler.trigger(Trigger::Manual).await.unwrap().unwrap();
    assert!(early.processed.is_empty());

    svc.clock.advance(HOUR_MS + MINUTE_MS);
    let report = svc.scheduler.trigger(Trigger::Manual).await.unwrap().unwrap();
    assert_eq!(report.processed.len(), 1);
    assert!(svc.lifecycle().repository().get(&b.id).await.is_none());

    for rx in [&mut renter_rx, &mut owner_rx] {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], Event::BookingCreated { .. }));
        assert!(matches!(seen[1], Event::OwnerConfirmed { .. }));
        assert!(matches!(seen[2], Event::BookingClaimed { by: Trigger::Manual, .. }));
        assert!(matches!(seen[3], Event::BookingDeleted { id } if id == b.id));
    }

    let page = svc
        .audit()
        .query(
            &LogFilter {
                owner_id: Some(owner),
                ..LogFilter::default()
            },
            Pagination::default(),
        )
        .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].booking_reference, "BK-1001");
    assert_eq!(page.entries[0].expired_at, svc.clock.now());
}

#[tokio::test]
async fn policy_change_never_moves_existing_deadlines() {
    let svc = start(&temp_dir());
    let owner = Ulid::new();
    let settings = svc.lifecycle().settings();

    settings
        .set_policy(PolicyUpdate {
            enabled: true,
            expiration_hours: 48,
        })
        .await
        .unwrap();
    let long = svc.book(Ulid::new(), owner, "BK-LONG").await;
    let long = svc.lifecycle().confirm_by_owner(long.id, owner).await.unwrap();

    let rejected = settings
        .set_policy(PolicyUpdate {
            enabled: true,
            expiration_hours: 99,
        })
        .await;
    assert!(matches!(rejected, Err(CoreError::Validation(_))));

    settings
        .set_policy(PolicyUpdate {
            enabled: true,
            expiration_hours: 2,
        })
        .await
        .unwrap();
    let short = svc.book(Ulid::new(), owner, "BK-SHORT").await;
    let short = svc.lifecycle().confirm_by_owner(short.id, owner).await.unwrap();

    assert_eq!(long.expires_at, Some(T0 + 48 * HOUR_MS));
    assert_eq!(short.expires_at, Some(T0 + 2 * HOUR_MS));

    svc.clock.set(T0 + 3 * HOUR_MS);
    let report = svc.scheduler.trigger(Trigger::Scheduled).await.unwrap().unwrap();
    let expired: Vec<Ulid> = report.processed.iter().map(|p| p.booking_id).collect();
    assert_eq!(expired, vec![short.id]);
    assert!(svc.lifecycle().repository().get(&long.id).await.is_some());
}

#[tokio::test]
async fn busy_scheduler_refuses_manual_runs() {
    let svc = start(&temp_dir());
    let owner = Ulid::new();
    for i in 0..50 {
        let b = svc.book(Ulid::new(), owner, &format!("BK-{i}")).await;
        svc.lifecycle().confirm_by_owner(b.id, owner).await.unwrap();
    }
    svc.clock.advance(3 * HOUR_MS);

    let (a, b) = tokio::join!(
        svc.scheduler.trigger(Trigger::Manual),
        svc.scheduler.trigger(Trigger::Manual),
    );
    let outcomes = [a, b];
    let ran: usize = outcomes
        .iter()
        .filter_map(|r| r.as_ref().ok().and_then(|r| r.as_ref()))
        .map(|r| r.processed.len())
        .sum();
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(TriggerError::Busy)))
        .count();
    assert_eq!(busy, 1);
    assert_eq!(ran, 50);
    assert_eq!(svc.audit().len().await, 50);
}

#[tokio::test]
async fn state_survives_restart_and_compaction() {
    let dir = temp_dir();
    let owner = Ulid::new();
    let (kept, log_id) = {
        let svc = start(&dir);
        let lapsed = svc.book(Ulid::new(), owner, "BK-GONE").await;
        svc.lifecycle().confirm_by_owner(lapsed.id, owner).await.unwrap();
        let kept = svc.book(Ulid::new(), owner, "BK-KEPT").await;

        svc.clock.advance(3 * HOUR_MS);
        let report = svc.scheduler.trigger(Trigger::Scheduled).await.unwrap().unwrap();
        assert_eq!(report.processed.len(), 1);

        svc.store.compact().await.unwrap();
        svc.store.close().await;
        (kept.id, report.processed[0].log_id)
    };

    let svc = start(&dir);
    let kept = svc.lifecycle().repository().get(&kept).await.unwrap();
    assert_eq!(kept.status, BookingStatus::Pending);
    assert_eq!(svc.audit().len().await, 1);
    assert!(svc.audit().get(&log_id).await.is_some());
    assert_eq!(
        svc.lifecycle().settings().last_run_at().await,
        Some(T0 + 3 * HOUR_MS)
    );

    assert_eq!(svc.audit().delete(Purge::All).await.unwrap(), 1);
    let stats = svc.scheduler.engine().stats().await;
    assert_eq!(stats.total, 0);
}
