
use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::limits::*;
use crate::model::*;
use crate::repository::BookingRepository;
use crate::settings::SettingsStore;
use crate::store::Store;

/// Result of a conditional claim. Losing the race is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller won; carries the row as it was just before the claim.
    Claimed(Booking),
    AlreadyClaimed,
}

/// The only writer of booking status, confirmation fields and `expires_at`.
///
/// ```text
/// pending ──confirm──▶ confirmed ──pay──▶ active ──complete──▶ completed
///    │                  │  │
///    └────cancel────────┴──┼──▶ cancelled
///                          └──claim──▶ expired
/// ```
#[derive(Clone)]
pub struct BookingLifecycle {
    store: Arc<Store>,
    repo: BookingRepository,
    settings: SettingsStore,
    clock: Arc<dyn Clock>,
}

fn transitioned(to: BookingStatus) {
    metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}

/// Claimed rows are inert and terminal rows are final.
fn ensure_live(b: &Booking, action: &'static str) -> Result<(), CoreError> {
    if b.is_expired || b.status.is_terminal() {
        return Err(CoreError::InvalidState {
            id: b.id,
            status: b.status,
            action,
        });
    }
    Ok(())
}

fn ensure_status(b: &Booking, allowed: &[BookingStatus], action: &'static str) -> Result<(), CoreError> {
    ensure_live(b, action)?;
    if !allowed.contains(&b.status) {
        return Err(CoreError::InvalidState {
            id: b.id,
            status: b.status,
            action,
        });
    }
    Ok(())
}

fn validate_new(new: &NewBooking) -> Result<(), CoreError> {
    if new.reference.is_empty() {
        return Err(CoreError::Validation("reference must not be empty".into()));
    }
    if new.reference.len() > MAX_REFERENCE_LEN {
        return Err(CoreError::LimitExceeded("reference too long"));
    }
    if new.product_title.is_empty() {
        return Err(CoreError::Validation("product title must not be empty".into()));
    }
    if new.product_title.len() > MAX_TITLE_LEN {
        return Err(CoreError::LimitExceeded("product title too long"));
    }
    if new.rental.start >= new.rental.end {
        return Err(CoreError::Validation(format!(
            "rental window [{}, {}) is empty",
            new.rental.start, new.rental.end
        )));
    }
    if new.rental.duration_ms() > MAX_RENTAL_DURATION_MS {
        return Err(CoreError::LimitExceeded("rental window too long"));
    }
    if new.total_amount < 0 {
        return Err(CoreError::Validation("amount must not be negative".into()));
    }
    if new.renter_id == new.owner_id {
        return Err(CoreError::Validation("renter and owner must differ".into()));
    }
    Ok(())
}

impl BookingLifecycle {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo: BookingRepository::new(store.clone()),
            settings: SettingsStore::new(store.clone()),
            store,
            clock,
        }
    }

    pub fn repository(&self) -> &BookingRepository {
        &self.repo
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Entry point for the booking creation service: a fresh `pending` row.
    pub async fn create(&self, new: NewBooking) -> Result<Booking, CoreError> {
        validate_new(&new)?;
        let booking = Booking {
            id: new.id,
            reference: new.reference,
            renter_id: new.renter_id,
            owner_id: new.owner_id,
            product_id: new.product_id,
            product_title: new.product_title,
            rental: new.rental,
            total_amount: new.total_amount,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            owner_confirmed: false,
            is_expired: false,
            created_at: self.clock.now(),
            owner_confirmed_at: None,
            expires_at: None,
            expired_at: None,
        };
        self.repo.insert(booking.clone()).await?;
        transitioned(BookingStatus::Pending);
        debug!("booking {} created", booking.id);
        Ok(booking)
    }

    /// Owner accepts a pending booking. The payment deadline is fixed here
    /// from the policy in force right now and never recomputed.
    pub async fn confirm_by_owner(&self, id: Ulid, owner_id: Ulid) -> Result<Booking, CoreError> {
        let (_gate, mut guard) = self.store.lock_booking(&id).await?;
        if guard.booking.owner_id != owner_id {
            return Err(CoreError::Forbidden {
                id,
                actor: owner_id,
                action: "confirm",
            });
        }
        ensure_status(&guard.booking, &[BookingStatus::Pending], "confirm")?;

        let now = self.clock.now();
        let policy = self.settings.get_policy().await;
        let event = Event::OwnerConfirmed {
            id,
            owner_id,
            at: now,
            expires_at: now + policy.expiration_hours.as_ms(),
        };
        self.store.persist_and_apply(&mut guard, &event).await?;
        transitioned(BookingStatus::Confirmed);
        info!(
            "booking {id} confirmed by owner; payment due within {}h",
            policy.expiration_hours.hours()
        );
        Ok(guard.booking.clone())
    }

    /// Payment collaborator callback. Success activates the booking; failure
    /// leaves it confirmed and still expirable.
    pub async fn record_payment(&self, id: Ulid, outcome: PaymentOutcome) -> Result<Booking, CoreError> {
        let (_gate, mut guard) = self.store.lock_booking(&id).await?;
        ensure_status(&guard.booking, &[BookingStatus::Confirmed], "record payment for")?;

        let status = match outcome {
            PaymentOutcome::Completed => PaymentStatus::Completed,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        };
        let event = Event::PaymentRecorded {
            id,
            status,
            at: self.clock.now(),
        };
        self.store.persist_and_apply(&mut guard, &event).await?;
        transitioned(guard.booking.status);
        info!("booking {id}: payment {status:?}");
        Ok(guard.booking.clone())
    }

    /// Either party may cancel before the booking is paid.
    pub async fn cancel(&self, id: Ulid, by: Ulid, reason: Option<String>) -> Result<Booking, CoreError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(CoreError::LimitExceeded("cancellation reason too long"));
        }
        let (_gate, mut guard) = self.store.lock_booking(&id).await?;
        if by != guard.booking.renter_id && by != guard.booking.owner_id {
            return Err(CoreError::Forbidden {
                id,
                actor: by,
                action: "cancel",
            });
        }
        ensure_status(
            &guard.booking,
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            "cancel",
        )?;

        let event = Event::BookingCancelled {
            id,
            by,
            reason,
            at: self.clock.now(),
        };
        self.store.persist_and_apply(&mut guard, &event).await?;
        transitioned(BookingStatus::Cancelled);
        info!("booking {id} cancelled by {by}");
        Ok(guard.booking.clone())
    }

    pub async fn complete(&self, id: Ulid) -> Result<Booking, CoreError> {
        let (_gate, mut guard) = self.store.lock_booking(&id).await?;
        ensure_status(&guard.booking, &[BookingStatus::Active], "complete")?;
        let event = Event::BookingCompleted {
            id,
            at: self.clock.now(),
        };
        self.store.persist_and_apply(&mut guard, &event).await?;
        transitioned(BookingStatus::Completed);
        Ok(guard.booking.clone())
    }

    /// The conditional update behind expiration: marks the row expired only
    /// if it is still confirmed, unclaimed, unpaid and due at `now`. The row
    /// lock is held across check, log and apply, so of any number of racing
    /// callers exactly one gets `Claimed`.
    pub async fn claim_for_expiration(&self, id: Ulid, now: Ms, by: Trigger) -> Result<Claim, CoreError> {
        let (_gate, mut guard) = match self.store.lock_booking(&id).await {
            Ok(locked) => locked,
            // Already claimed and deleted by another run.
            Err(CoreError::NotFound(_)) => return Ok(Claim::AlreadyClaimed),
            Err(e) => return Err(e),
        };
        if !guard.booking.is_expiration_candidate(now) {
            return Ok(Claim::AlreadyClaimed);
        }

        let before = guard.booking.clone();
        let event = Event::BookingClaimed { id, at: now, by };
        self.store.persist_and_apply(&mut guard, &event).await?;
        transitioned(BookingStatus::Expired);
        Ok(Claim::Claimed(before))
    }
}
