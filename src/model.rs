use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open rental window `[start, end)` held on a product's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Ms,
    pub end: Ms,
}

impl DateRange {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Cancelled,
    Expired,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::Expired | BookingStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned by the payment collaborator; read here to decide expirability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Only unpaid bookings may lapse.
    pub fn is_expirable(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Failed)
    }
}

/// What the payment collaborator reports for a confirmed booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Completed,
    Failed,
}

/// Who started an expiration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub reference: String,
    pub renter_id: Ulid,
    pub owner_id: Ulid,
    pub product_id: Ulid,
    pub product_title: String,
    pub rental: DateRange,
    /// Minor currency units.
    pub total_amount: i64,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub owner_confirmed: bool,
    /// Claim flag. Once set the row is only ever deleted.
    pub is_expired: bool,
    pub created_at: Ms,
    pub owner_confirmed_at: Option<Ms>,
    pub expires_at: Option<Ms>,
    pub expired_at: Option<Ms>,
}

impl Booking {
    /// The expiration predicate evaluated against one instant.
    pub fn is_expiration_candidate(&self, now: Ms) -> bool {
        self.status == BookingStatus::Confirmed
            && !self.is_expired
            && self.payment_status.is_expirable()
            && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Input from the booking creation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub reference: String,
    pub renter_id: Ulid,
    pub owner_id: Ulid,
    pub product_id: Ulid,
    pub product_title: String,
    pub rental: DateRange,
    pub total_amount: i64,
}

/// One row of a booking's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub at: Ms,
    pub actor: Option<Ulid>,
    pub note: Option<String>,
}

/// A booking row plus its dependent rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub booking: Booking,
    pub history: Vec<StatusChange>,
}

// ── Expiration policy ────────────────────────────────────────────

/// The payment windows an administrator may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationHours {
    Two,
    Four,
    Eight,
    Twelve,
    TwentyFour,
    FortyEight,
}

impl ExpirationHours {
    pub const ALLOWED: [u32; 6] = [2, 4, 8, 12, 24, 48];

    pub fn hours(self) -> u32 {
        match self {
            ExpirationHours::Two => 2,
            ExpirationHours::Four => 4,
            ExpirationHours::Eight => 8,
            ExpirationHours::Twelve => 12,
            ExpirationHours::TwentyFour => 24,
            ExpirationHours::FortyEight => 48,
        }
    }

    pub fn as_ms(self) -> Ms {
        Ms::from(self.hours()) * HOUR_MS
    }
}

impl TryFrom<u32> for ExpirationHours {
    type Error = u32;

    fn try_from(hours: u32) -> Result<Self, Self::Error> {
        match hours {
            2 => Ok(ExpirationHours::Two),
            4 => Ok(ExpirationHours::Four),
            8 => Ok(ExpirationHours::Eight),
            12 => Ok(ExpirationHours::Twelve),
            24 => Ok(ExpirationHours::TwentyFour),
            48 => Ok(ExpirationHours::FortyEight),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    pub enabled: bool,
    pub expiration_hours: ExpirationHours,
    pub last_run_at: Option<Ms>,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration_hours: ExpirationHours::Two,
            last_run_at: None,
        }
    }
}

/// Raw administrative input, validated by the settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyUpdate {
    pub enabled: bool,
    pub expiration_hours: u32,
}

// ── Audit log ────────────────────────────────────────────────────

/// Immutable snapshot of a booking taken when it was judged expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationLogEntry {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub booking_reference: String,
    pub owner_id: Ulid,
    pub renter_id: Ulid,
    pub product_id: Ulid,
    pub product_title: String,
    pub booking_created_at: Ms,
    pub expires_at: Option<Ms>,
    pub expiration_hours: u32,
    pub total_amount: i64,
    /// The booking row as JSON text.
    pub snapshot: String,
    pub reason: String,
    pub expired_at: Ms,
    pub expired_by: Trigger,
}

impl ExpirationLogEntry {
    pub fn snapshot_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.snapshot)
    }
}

/// Every durable change, flat and unnested. This is the log record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    /// Full row with history; emitted by compaction only.
    BookingRestored {
        record: BookingRecord,
    },
    OwnerConfirmed {
        id: Ulid,
        owner_id: Ulid,
        at: Ms,
        expires_at: Ms,
    },
    PaymentRecorded {
        id: Ulid,
        status: PaymentStatus,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        by: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        at: Ms,
    },
    BookingClaimed {
        id: Ulid,
        at: Ms,
        by: Trigger,
    },
    BookingDeleted {
        id: Ulid,
    },
    PolicyUpdated {
        enabled: bool,
        expiration_hours: ExpirationHours,
    },
    RunRecorded {
        at: Ms,
    },
    ExpirationLogged {
        entry: ExpirationLogEntry,
    },
    ExpirationLogsPurged {
        ids: Vec<Ulid>,
    },
}

impl Event {
    /// The booking this event mutates, if any.
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.id),
            Event::BookingRestored { record } => Some(record.booking.id),
            Event::OwnerConfirmed { id, .. }
            | Event::PaymentRecorded { id, .. }
            | Event::BookingCancelled { id, .. }
            | Event::BookingCompleted { id, .. }
            | Event::BookingClaimed { id, .. }
            | Event::BookingDeleted { id } => Some(*id),
            Event::PolicyUpdated { .. }
            | Event::RunRecorded { .. }
            | Event::ExpirationLogged { .. }
            | Event::ExpirationLogsPurged { .. } => None,
        }
    }
}
