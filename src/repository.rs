use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::CoreError;
use crate::model::*;
use crate::store::{new_record, Store};

/// Persistence of booking rows and their status history.
#[derive(Clone)]
pub struct BookingRepository {
    store: Arc<Store>,
}

impl BookingRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub(crate) async fn insert(&self, booking: Booking) -> Result<(), CoreError> {
        let _gate = self.store.gate.read().await;
        let rec = Arc::new(RwLock::new(new_record(booking.clone())));
        // Publish the row locked so nobody reads it before it is logged.
        let _row = rec.clone().write_owned().await;
        {
            let _admit = self.store.admit.lock().await;
            if self.store.bookings.len() >= self.store.max_bookings {
                return Err(CoreError::LimitExceeded("too many live bookings"));
            }
            match self.store.bookings.entry(booking.id) {
                Entry::Occupied(_) => return Err(CoreError::AlreadyExists(booking.id)),
                Entry::Vacant(slot) => {
                    slot.insert(rec);
                }
            }
        }
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.store.wal_append(&event).await {
            self.store.bookings.remove(&booking.id);
            return Err(e);
        }
        self.store.notify_parties(&booking, &event);
        Ok(())
    }

    pub async fn get(&self, id: &Ulid) -> Option<Booking> {
        let rec = self.store.get_record(id)?;
        let guard = rec.read().await;
        Some(guard.booking.clone())
    }

    pub async fn history(&self, id: &Ulid) -> Option<Vec<StatusChange>> {
        let rec = self.store.get_record(id)?;
        let guard = rec.read().await;
        Some(guard.history.clone())
    }

    pub fn len(&self) -> usize {
        self.store.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.bookings.is_empty()
    }

    /// Snapshot of every row matching `pred`, oldest deadline first.
    async fn scan(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let records: Vec<_> = self.store.bookings.iter().map(|e| e.value().clone()).collect();
        let mut hits = Vec::new();
        for rec in records {
            let guard = rec.read().await;
            if pred(&guard.booking) {
                hits.push(guard.booking.clone());
            }
        }
        hits.sort_by_key(|b| (b.expires_at, b.id));
        hits
    }

    /// Confirmed, unclaimed, unpaid bookings whose deadline is at or before `now`.
    ///
    /// A read-only snapshot: rows may be claimed by someone else before the
    /// caller gets to them, which the conditional claim absorbs.
    pub async fn find_expiration_candidates(&self, now: Ms) -> Result<Vec<Booking>, CoreError> {
        self.store.ensure_open()?;
        Ok(self.scan(|b| b.is_expiration_candidate(now)).await)
    }

    /// Bookings that will become candidates within `(now, now + window]`.
    pub async fn find_upcoming(&self, now: Ms, window: Ms) -> Vec<Booking> {
        self.scan(|b| {
            b.status == BookingStatus::Confirmed
                && !b.is_expired
                && b.payment_status.is_expirable()
                && b.expires_at.is_some_and(|at| at > now && at <= now + window)
        })
        .await
    }

    /// Claimed rows left behind by a failed delete.
    pub async fn find_inert(&self) -> Vec<Booking> {
        self.scan(|b| b.is_expired).await
    }

    /// Remove a booking together with its status history.
    pub async fn delete_cascade(&self, id: &Ulid) -> Result<(), CoreError> {
        let (_gate, guard) = self.store.lock_booking(id).await?;
        let event = Event::BookingDeleted { id: *id };
        self.store.wal_append(&event).await?;
        self.store.bookings.remove(id);
        self.store.notify_parties(&guard.booking, &event);
        Ok(())
    }
}
