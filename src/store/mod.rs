mod compact;
mod tables;

pub use compact::run_compactor;
pub(crate) use tables::{apply_to_record, new_record, AuditTable, Settings};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::error::CoreError;
use crate::limits::MAX_BOOKINGS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use tables::Tables;

pub type SharedRecord = Arc<RwLock<BookingRecord>>;

// ── Group-commit writer ──────────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown,
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the log. Appends that arrive while one is being written are folded
/// into the same fsync; any other command first flushes the pending batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut next = Some(cmd);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                other => {
                    commit_batch(&mut wal, &mut batch);
                    if !handle_control(&mut wal, other) {
                        return;
                    }
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    if result.is_ok() {
        result = wal.flush_sync();
    }
    // Every caller in the batch is told it failed, so none of it may replay.
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("wal rollback after failed batch: {e}");
        }
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false when the writer should stop.
fn handle_control(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown => false,
        WalCommand::Append { .. } => true,
    }
}

/// Durable tables behind one write-ahead log: bookings (with their status
/// history), typed settings, and the expiration log.
///
/// Every mutation is logged before it is applied. Writers take the
/// compaction gate (shared) before any row lock, so compaction (exclusive)
/// always sees a state that matches the log.
pub struct Store {
    pub(crate) bookings: DashMap<Ulid, SharedRecord>,
    pub(crate) settings: RwLock<Settings>,
    pub(crate) audit: RwLock<AuditTable>,
    pub(crate) gate: RwLock<()>,
    /// Serializes the row-count check with publishing a new row.
    pub(crate) admit: Mutex<()>,
    pub(crate) max_bookings: usize,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Store {
    /// Recover state from `wal_path` and start the writer task.
    /// Must be called from inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let tables = Tables::from_events(&events);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let bookings = DashMap::with_capacity(tables.bookings.len());
        for (id, rec) in tables.bookings {
            bookings.insert(id, Arc::new(RwLock::new(rec)));
        }
        tracing::info!(
            "store {}: replayed {} events, {} live bookings",
            wal_path.display(),
            events.len(),
            bookings.len()
        );

        Ok(Self {
            bookings,
            settings: RwLock::new(tables.settings),
            audit: RwLock::new(tables.audit),
            gate: RwLock::new(()),
            admit: Mutex::new(()),
            max_bookings: MAX_BOOKINGS,
            wal_tx,
            notify,
        })
    }

    /// Stop the writer. Every later write fails with `StorageError`.
    pub async fn close(&self) {
        let _ = self.wal_tx.send(WalCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.wal_tx.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::Storage("store is closed".into()));
        }
        Ok(())
    }

    /// Write event to the log via the group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| CoreError::Storage("log writer shut down".into()))?;
        rx.await
            .map_err(|_| CoreError::Storage("log writer dropped response".into()))?
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub fn get_record(&self, id: &Ulid) -> Option<SharedRecord> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Enter the write path: shared gate first, then the row's write lock.
    pub(crate) async fn lock_booking(
        &self,
        id: &Ulid,
    ) -> Result<(RwLockReadGuard<'_, ()>, OwnedRwLockWriteGuard<BookingRecord>), CoreError> {
        let gate = self.gate.read().await;
        let rec = self.get_record(id).ok_or(CoreError::NotFound(*id))?;
        let guard = rec.clone().write_owned().await;
        // The row may have been unpublished (failed insert, delete) while we waited.
        if !self.get_record(id).is_some_and(|live| Arc::ptr_eq(&live, &rec)) {
            return Err(CoreError::NotFound(*id));
        }
        Ok((gate, guard))
    }

    /// Log + apply + notify for a row the caller has locked.
    pub(crate) async fn persist_and_apply(
        &self,
        rec: &mut BookingRecord,
        event: &Event,
    ) -> Result<(), CoreError> {
        self.wal_append(event).await?;
        apply_to_record(rec, event);
        self.notify_parties(&rec.booking, event);
        Ok(())
    }

    pub(crate) fn notify_parties(&self, booking: &Booking, event: &Event) {
        self.notify.send(booking.renter_id, event);
        self.notify.send(booking.owner_id, event);
    }

    /// Ask the writer how many events were appended since the last compaction.
    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(crate) async fn send_compact(&self, events: Vec<Event>) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| CoreError::Storage("log writer shut down".into()))?;
        rx.await
            .map_err(|_| CoreError::Storage("log writer dropped response".into()))?
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}
