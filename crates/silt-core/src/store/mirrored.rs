//! Dual-write coordinator over the local and remote tiers
//!
//! Every write goes to the local store first. If the remote backend is
//! reachable the write is mirrored immediately; if it reports unavailable,
//! the operation is queued in the durable log and the row joins the dirty
//! set until a later flush confirms it remotely. Reads route to whichever
//! tier holds the freshest confirmed value.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{LocalStore, RemoteStore};
use crate::models::{ColumnValue, Operation};
use crate::queue::{EntryId, OperationLog};
use crate::schema::SchemaRegistry;

/// How a write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Applied to both tiers
    Completed,
    /// Applied locally; queued for replay against the remote backend
    Enqueued,
}

impl ExecuteOutcome {
    #[must_use]
    pub const fn is_enqueued(self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// Rows whose latest confirmed write is local-only
///
/// A counted multiset keyed by `(table, row_id)`: each pending queue entry
/// contributes one count, so the set empties exactly when the queue does.
/// Wildcard entries (empty `row_id` or empty `table`) shadow their whole
/// scope.
#[derive(Debug, Default)]
struct DirtyRows {
    counts: HashMap<(String, String), usize>,
}

impl DirtyRows {
    fn from_pending(pending: Vec<(String, String)>) -> Self {
        let mut rows = Self::default();
        for (table, row_id) in pending {
            rows.mark(table, row_id);
        }
        rows
    }

    fn mark(&mut self, table: String, row_id: String) {
        *self.counts.entry((table, row_id)).or_insert(0) += 1;
    }

    fn unmark(&mut self, table: &str, row_id: &str) {
        let key = (table.to_string(), row_id.to_string());
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
    }

    fn is_dirty(&self, table: &str, row_id: &str) -> bool {
        self.contains(table, row_id) || self.contains(table, "") || self.contains("", "")
    }

    fn contains(&self, table: &str, row_id: &str) -> bool {
        self.counts
            .contains_key(&(table.to_string(), row_id.to_string()))
    }
}

/// Queue and dirty tracking, guarded together so enqueue, drain, and
/// dequeue never interleave into a partial state
struct QueueState {
    log: OperationLog,
    dirty: DirtyRows,
}

/// Store that mirrors writes to the remote backend, degrading to the
/// operation log whenever the backend is unreachable
pub struct MirroredStore {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    registry: Arc<SchemaRegistry>,
    state: Mutex<QueueState>,
}

impl MirroredStore {
    /// Open the store, rebuilding dirty-row tracking from any operations
    /// still queued from a previous run
    pub fn open(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        registry: Arc<SchemaRegistry>,
        queue_dir: impl Into<PathBuf>,
    ) -> crate::Result<Self> {
        let log = OperationLog::open(queue_dir)?;
        let dirty = DirtyRows::from_pending(log.pending_rows()?);
        Ok(Self {
            remote,
            local,
            registry,
            state: Mutex::new(QueueState { log, dirty }),
        })
    }

    /// Apply one operation to both tiers
    ///
    /// The local write always happens and any local failure propagates.
    /// A remote `Unavailable` is absorbed by queueing the operation for
    /// replay; every other remote failure propagates without queueing.
    pub async fn execute(&self, op: Operation) -> crate::Result<ExecuteOutcome> {
        op.validate()?;
        if !op.targets_all_tables() && self.registry.table(&op.table).is_none() {
            return Err(crate::Error::InvalidInput(format!(
                "unknown table: {}",
                op.table
            )));
        }

        // Replay backlog first so this write cannot overtake queued
        // operations for the same row. Flush trouble is not this write's
        // failure; a real storage fault resurfaces at enqueue time.
        if let Err(err) = self.flush_queued().await {
            tracing::warn!("Pre-write flush failed: {err}");
        }

        self.local.execute(&op).await?;

        match self.remote.execute(&op).await {
            Ok(()) => Ok(ExecuteOutcome::Completed),
            Err(err) if err.is_unavailable() => {
                tracing::debug!(
                    "Remote unavailable, queueing {:?} for {}/{}",
                    op.kind,
                    op.table,
                    op.row_id
                );
                let mut state = self.state.lock().await;
                let (table, row_id) = (op.table.clone(), op.row_id.clone());
                state.log.enqueue(op)?;
                state.dirty.mark(table, row_id);
                Ok(ExecuteOutcome::Enqueued)
            }
            Err(err) => Err(err),
        }
    }

    /// Read one row from whichever tier is authoritative for it
    ///
    /// Rows with unconfirmed local changes read locally, as does everything
    /// while the backend is unreachable. Remote read failures of any kind
    /// fall back to the local value rather than propagating.
    pub async fn read(
        &self,
        table: &str,
        row_id: &str,
    ) -> crate::Result<Option<Vec<ColumnValue>>> {
        if let Err(err) = self.flush_queued().await {
            tracing::warn!("Pre-read flush failed: {err}");
        }

        let dirty = self.state.lock().await.dirty.is_dirty(table, row_id);
        if dirty || !self.remote.is_available() {
            return self.local.read(table, row_id).await;
        }

        match self.remote.read(table, row_id).await {
            Ok(row) => Ok(row),
            Err(err) => {
                tracing::warn!("Remote read of {table}/{row_id} failed, serving local: {err}");
                self.local.read(table, row_id).await
            }
        }
    }

    /// Replay queued operations against the remote backend, in issuance
    /// order
    ///
    /// A no-op while the backend reports unavailable. Replay stops at the
    /// first entry that fails with `Unavailable` so ordering is preserved;
    /// entries that fail for any other reason are moved to the dead-letter
    /// directory and replay continues.
    pub async fn flush_queued(&self) -> crate::Result<()> {
        if self.remote.ensure_available().await.is_err() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.log.is_empty() {
            return Ok(());
        }

        for (id, op) in state.log.drain()? {
            match self.remote.execute(&op).await {
                Ok(()) => {
                    state.log.dequeue(&id)?;
                    state.dirty.unmark(&op.table, &op.row_id);
                }
                Err(err) if err.is_unavailable() => {
                    tracing::debug!("Remote unavailable mid-flush, {} entries remain: {err}", state.log.len());
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        "Replay of {:?} for {}/{} failed permanently, dead-lettering entry {id}: {err}",
                        op.kind,
                        op.table,
                        op.row_id
                    );
                    state.log.dead_letter(&id)?;
                    state.dirty.unmark(&op.table, &op.row_id);
                }
            }
        }
        Ok(())
    }

    /// Flush whenever the backend transitions to available
    pub fn spawn_availability_flush(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut availability = store.remote.watch_availability();
        tokio::spawn(async move {
            while availability.changed().await.is_ok() {
                if !availability.borrow_and_update().is_available() {
                    continue;
                }
                tracing::info!("Remote backend reachable again, replaying queued operations");
                if let Err(err) = store.flush_queued().await {
                    tracing::warn!("Flush after availability change failed: {err}");
                }
            }
        })
    }

    /// Number of operations awaiting replay
    pub async fn pending(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Whether the row's latest confirmed write is local-only
    pub async fn is_locally_modified(&self, table: &str, row_id: &str) -> bool {
        self.state.lock().await.dirty.is_dirty(table, row_id)
    }

    /// Entries pulled from the queue after a non-retriable replay failure
    pub async fn dead_letters(&self) -> crate::Result<Vec<(EntryId, Operation)>> {
        self.state.lock().await.log.dead_letters()
    }
}
