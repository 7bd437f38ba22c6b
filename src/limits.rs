//! Hard bounds on inputs and table sizes.

pub const MAX_REFERENCE_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

/// Live booking rows held by one store.
pub const MAX_BOOKINGS: usize = 1_000_000;

/// Largest page `AuditLog::query` will return.
pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Reject rental windows longer than a year.
pub const MAX_RENTAL_DURATION_MS: i64 = 366 * 24 * 3_600_000;

/// Window used by stats for "recent" and "upcoming" expirations.
pub const STATS_WINDOW_MS: i64 = 24 * 3_600_000;
