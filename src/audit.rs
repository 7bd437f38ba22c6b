use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::error::CoreError;
use crate::limits::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::model::*;
use crate::store::Store;

/// Which log entries to return. Unset fields match everything; the time
/// range is `[expired_from, expired_to)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub booking_id: Option<Ulid>,
    pub owner_id: Option<Ulid>,
    pub renter_id: Option<Ulid>,
    pub product_id: Option<Ulid>,
    pub expired_by: Option<Trigger>,
    pub expired_from: Option<Ms>,
    pub expired_to: Option<Ms>,
}

impl LogFilter {
    fn matches(&self, e: &ExpirationLogEntry) -> bool {
        self.booking_id.is_none_or(|id| e.booking_id == id)
            && self.owner_id.is_none_or(|id| e.owner_id == id)
            && self.renter_id.is_none_or(|id| e.renter_id == id)
            && self.product_id.is_none_or(|id| e.product_id == id)
            && self.expired_by.is_none_or(|t| e.expired_by == t)
            && self.expired_from.is_none_or(|t| e.expired_at >= t)
            && self.expired_to.is_none_or(|t| e.expired_at < t)
    }
}

/// 1-based page; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    pub entries: Vec<ExpirationLogEntry>,
    /// Matches across all pages.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    One(Ulid),
    All,
}

/// Append-only record of every expiration, at most one entry per booking.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Durably append `entry`. A second entry for the same booking is refused.
    pub async fn record(&self, entry: ExpirationLogEntry) -> Result<(), CoreError> {
        let _gate = self.store.gate.read().await;
        let mut audit = self.store.audit.write().await;
        if audit.by_booking.contains_key(&entry.booking_id) {
            return Err(CoreError::AlreadyExists(entry.booking_id));
        }
        let event = Event::ExpirationLogged { entry };
        self.store.wal_append(&event).await?;
        audit.apply(&event);
        Ok(())
    }

    pub async fn get(&self, id: &Ulid) -> Option<ExpirationLogEntry> {
        self.store.audit.read().await.entries.get(id).cloned()
    }

    pub async fn entry_for_booking(&self, booking_id: &Ulid) -> Option<ExpirationLogEntry> {
        let audit = self.store.audit.read().await;
        let id = audit.by_booking.get(booking_id)?;
        audit.entries.get(id).cloned()
    }

    /// Newest first.
    pub async fn query(&self, filter: &LogFilter, pagination: Pagination) -> LogPage {
        let page = pagination.page.max(1);
        let limit = pagination.limit.clamp(1, MAX_PAGE_SIZE);

        let audit = self.store.audit.read().await;
        let mut hits: Vec<&ExpirationLogEntry> =
            audit.entries.values().filter(|e| filter.matches(e)).collect();
        hits.sort_by(|a, b| b.expired_at.cmp(&a.expired_at).then(b.id.cmp(&a.id)));

        let total = hits.len();
        let entries = hits
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();
        LogPage {
            entries,
            total,
            page,
            limit,
        }
    }

    pub async fn len(&self) -> usize {
        self.store.audit.read().await.entries.len()
    }

    pub async fn count_since(&self, since: Ms) -> usize {
        self.store
            .audit
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.expired_at >= since)
            .count()
    }

    /// Administrative purge. Returns how many entries were removed.
    pub async fn delete(&self, purge: Purge) -> Result<usize, CoreError> {
        let _gate = self.store.gate.read().await;
        let mut audit = self.store.audit.write().await;
        let ids: Vec<Ulid> = match purge {
            Purge::One(id) if audit.entries.contains_key(&id) => vec![id],
            Purge::One(id) => return Err(CoreError::NotFound(id)),
            Purge::All => audit.entries.keys().copied().collect(),
        };
        if ids.is_empty() {
            return Ok(0);
        }
        let event = Event::ExpirationLogsPurged { ids };
        self.store.wal_append(&event).await?;
        let before = audit.entries.len();
        audit.apply(&event);
        let removed = before - audit.entries.len();
        info!("purged {removed} expiration log entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lapse_test_audit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(name: &str) -> AuditLog {
        let store = Store::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
        AuditLog::new(Arc::new(store))
    }

    fn entry(expired_at: Ms, expired_by: Trigger) -> ExpirationLogEntry {
        ExpirationLogEntry {
            id: Ulid::new(),
            booking_id: Ulid::new(),
            booking_reference: format!("BK-{expired_at}"),
            owner_id: Ulid::new(),
            renter_id: Ulid::new(),
            product_id: Ulid::new(),
            product_title: "Projector".into(),
            booking_created_at: 0,
            expires_at: Some(expired_at - 1),
            expiration_hours: 2,
            total_amount: 2_500,
            snapshot: "{}".into(),
            reason: "payment window elapsed".into(),
            expired_at,
            expired_by,
        }
    }

    #[tokio::test]
    async fn one_entry_per_booking() {
        let log = open("one_per_booking.wal");
        let first = entry(10, Trigger::Scheduled);
        log.record(first.clone()).await.unwrap();

        let mut dup = entry(11, Trigger::Manual);
        dup.booking_id = first.booking_id;
        let result = log.record(dup).await;
        assert!(matches!(result, Err(CoreError::AlreadyExists(_))));
        assert_eq!(log.len().await, 1);
        assert_eq!(log.entry_for_booking(&first.booking_id).await, Some(first));
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let log = open("query.wal");
        for t in [100, 300, 200] {
            log.record(entry(t, Trigger::Scheduled)).await.unwrap();
        }
        log.record(entry(250, Trigger::Manual)).await.unwrap();

        let all = log.query(&LogFilter::default(), Pagination::default()).await;
        assert_eq!(all.total, 4);
        let times: Vec<Ms> = all.entries.iter().map(|e| e.expired_at).collect();
        assert_eq!(times, vec![300, 250, 200, 100]);

        let manual = LogFilter {
            expired_by: Some(Trigger::Manual),
            ..LogFilter::default()
        };
        let page = log.query(&manual, Pagination::default()).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].expired_at, 250);

        let window = LogFilter {
            expired_from: Some(200),
            expired_to: Some(300),
            ..LogFilter::default()
        };
        let page = log.query(&window, Pagination::default()).await;
        let times: Vec<Ms> = page.entries.iter().map(|e| e.expired_at).collect();
        assert_eq!(times, vec![250, 200]);
    }

    #[tokio::test]
    async fn pagination_clamps_and_pages() {
        let log = open("paging.wal");
        for t in 1..=5 {
            log.record(entry(t, Trigger::Scheduled)).await.unwrap();
        }
        let p2 = log.query(&LogFilter::default(), Pagination { page: 2, limit: 2 }).await;
        assert_eq!(p2.total, 5);
        let times: Vec<Ms> = p2.entries.iter().map(|e| e.expired_at).collect();
        assert_eq!(times, vec![3, 2]);

        let beyond = log.query(&LogFilter::default(), Pagination { page: 9, limit: 2 }).await;
        assert!(beyond.entries.is_empty());
        assert_eq!(beyond.total, 5);

        let clamped = log
            .query(&LogFilter::default(), Pagination { page: 0, limit: 10_000 })
            .await;
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.limit, MAX_PAGE_SIZE);
        assert_eq!(clamped.entries.len(), 5);
    }

    #[tokio::test]
    async fn delete_one_and_all() {
        let log = open("purge.wal");
        let a = entry(1, Trigger::Scheduled);
        log.record(a.clone()).await.unwrap();
        log.record(entry(2, Trigger::Scheduled)).await.unwrap();
        log.record(entry(3, Trigger::Manual)).await.unwrap();

        assert_eq!(log.delete(Purge::One(a.id)).await.unwrap(), 1);
        assert!(log.get(&a.id).await.is_none());
        assert!(matches!(
            log.delete(Purge::One(a.id)).await,
            Err(CoreError::NotFound(_))
        ));

        assert_eq!(log.delete(Purge::All).await.unwrap(), 2);
        assert_eq!(log.len().await, 0);
        assert_eq!(log.delete(Purge::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_since_uses_expired_at() {
        let log = open("count_since.wal");
        for t in [10, 20, 30] {
            log.record(entry(t, Trigger::Scheduled)).await.unwrap();
        }
        assert_eq!(log.count_since(20).await, 2);
        assert_eq!(log.count_since(31).await, 0);
    }
}
