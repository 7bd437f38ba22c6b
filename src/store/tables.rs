use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

/// Apply a row-level event to one booking (caller holds the row lock).
/// Create/restore/delete are handled at the table level, not here.
pub(crate) fn apply_to_record(rec: &mut BookingRecord, event: &Event) {
    let b = &mut rec.booking;
    let from = b.status;
    let change = match event {
        Event::OwnerConfirmed {
            owner_id,
            at,
            expires_at,
            ..
        } => {
            b.owner_confirmed = true;
            b.owner_confirmed_at = Some(*at);
            b.expires_at = Some(*expires_at);
            b.status = BookingStatus::Confirmed;
            Some((*at, Some(*owner_id), None))
        }
        Event::PaymentRecorded { status, at, .. } => {
            b.payment_status = *status;
            if *status == PaymentStatus::Completed {
                b.status = BookingStatus::Active;
            }
            Some((*at, None, Some(format!("payment {status:?}").to_lowercase())))
        }
        Event::BookingCancelled { by, reason, at, .. } => {
            b.status = BookingStatus::Cancelled;
            Some((*at, Some(*by), reason.clone()))
        }
        Event::BookingCompleted { at, .. } => {
            b.status = BookingStatus::Completed;
            Some((*at, None, None))
        }
        Event::BookingClaimed { at, by, .. } => {
            b.is_expired = true;
            b.expired_at = Some(*at);
            b.status = BookingStatus::Expired;
            Some((*at, None, Some(format!("expired by {} run", by.as_str()))))
        }
        Event::BookingCreated { .. }
        | Event::BookingRestored { .. }
        | Event::BookingDeleted { .. }
        | Event::PolicyUpdated { .. }
        | Event::RunRecorded { .. }
        | Event::ExpirationLogged { .. }
        | Event::ExpirationLogsPurged { .. } => None,
    };
    if let Some((at, actor, note)) = change {
        rec.history.push(StatusChange {
            from: Some(from),
            to: rec.booking.status,
            at,
            actor,
            note,
        });
    }
}

pub(crate) fn new_record(booking: Booking) -> BookingRecord {
    let created = StatusChange {
        from: None,
        to: booking.status,
        at: booking.created_at,
        actor: Some(booking.renter_id),
        note: None,
    };
    BookingRecord {
        booking,
        history: vec![created],
    }
}

/// The settings table, typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    /// `None` until an administrator stores a policy.
    pub policy: Option<(bool, ExpirationHours)>,
    pub last_run_at: Option<Ms>,
}

impl Settings {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::PolicyUpdated {
                enabled,
                expiration_hours,
            } => self.policy = Some((*enabled, *expiration_hours)),
            Event::RunRecorded { at } => self.last_run_at = Some(*at),
            _ => {}
        }
    }

    pub fn effective_policy(&self) -> ExpirationPolicy {
        let mut policy = ExpirationPolicy::default();
        if let Some((enabled, hours)) = self.policy {
            policy.enabled = enabled;
            policy.expiration_hours = hours;
        }
        policy.last_run_at = self.last_run_at;
        policy
    }

    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some((enabled, expiration_hours)) = self.policy {
            events.push(Event::PolicyUpdated {
                enabled,
                expiration_hours,
            });
        }
        if let Some(at) = self.last_run_at {
            events.push(Event::RunRecorded { at });
        }
        events
    }
}

/// The expiration-log table with its one-entry-per-booking index.
#[derive(Debug, Default)]
pub(crate) struct AuditTable {
    pub entries: BTreeMap<Ulid, ExpirationLogEntry>,
    pub by_booking: HashMap<Ulid, Ulid>,
}

impl AuditTable {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ExpirationLogged { entry } => {
                self.by_booking.insert(entry.booking_id, entry.id);
                self.entries.insert(entry.id, entry.clone());
            }
            Event::ExpirationLogsPurged { ids } => {
                for id in ids {
                    if let Some(entry) = self.entries.remove(id) {
                        self.by_booking.remove(&entry.booking_id);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Plain owned state rebuilt from the log before the live store is assembled.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub bookings: HashMap<Ulid, BookingRecord>,
    pub settings: Settings,
    pub audit: AuditTable,
}

impl Tables {
    pub fn from_events(events: &[Event]) -> Self {
        let mut tables = Self::default();
        for event in events {
            tables.apply(event);
        }
        tables
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.bookings.insert(booking.id, new_record(booking.clone()));
            }
            Event::BookingRestored { record } => {
                self.bookings.insert(record.booking.id, record.clone());
            }
            Event::BookingDeleted { id } => {
                self.bookings.remove(id);
            }
            Event::PolicyUpdated { .. } | Event::RunRecorded { .. } => self.settings.apply(event),
            Event::ExpirationLogged { .. } | Event::ExpirationLogsPurged { .. } => {
                self.audit.apply(event)
            }
            other => {
                if let Some(rec) = other.booking_id().and_then(|id| self.bookings.get_mut(&id)) {
                    apply_to_record(rec, other);
                }
            }
        }
    }
}
