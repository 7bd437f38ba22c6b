use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::*;

use super::Store;

impl Store {
    /// Rewrite the log with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<usize, CoreError> {
        // Exclusive gate: no write is between "logged" and "applied" while we snapshot.
        let _gate = self.gate.write().await;

        let mut events = self.settings.read().await.to_events();

        let records: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut restored = Vec::with_capacity(records.len());
        for rec in records {
            restored.push(rec.read().await.clone());
        }
        restored.sort_by_key(|r| r.booking.id);
        events.extend(
            restored
                .into_iter()
                .map(|record| Event::BookingRestored { record }),
        );

        {
            let audit = self.audit.read().await;
            events.extend(
                audit
                    .entries
                    .values()
                    .map(|entry| Event::ExpirationLogged {
                        entry: entry.clone(),
                    }),
            );
        }

        let count = events.len();
        self.send_compact(events).await?;
        Ok(count)
    }
}

/// Background task that compacts the log once enough appends pile up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if store.is_closed() {
            debug!("compactor stopping: store closed");
            return;
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(events) => info!("compacted log: {appends} appends folded into {events} events"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lapse_test_compact");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_preserves_state_across_reopen() {
        let path = test_wal_path("reopen.wal");
        let store = Store::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();

        let event = Event::PolicyUpdated {
            enabled: true,
            expiration_hours: ExpirationHours::Eight,
        };
        for _ in 0..10 {
            store.wal_append(&event).await.unwrap();
            store.settings.write().await.apply(&event);
        }
        let run = Event::RunRecorded { at: 1_234 };
        store.wal_append(&run).await.unwrap();
        store.settings.write().await.apply(&run);

        let written = store.compact().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.wal_appends_since_compact().await, 0);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event, run]);
        store.close().await;

        let reopened = Store::open(path, Arc::new(NotifyHub::new())).unwrap();
        let policy = reopened.settings.read().await.effective_policy();
        assert_eq!(policy.expiration_hours, ExpirationHours::Eight);
        assert_eq!(policy.last_run_at, Some(1_234));
    }

    #[tokio::test]
    async fn compaction_of_empty_store() {
        let path = test_wal_path("empty.wal");
        let store = Store::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.compact().await.unwrap(), 0);
        assert!(Wal::replay(&path).unwrap().events.is_empty());
        assert!(store.get_record(&Ulid::new()).is_none());
    }
}
