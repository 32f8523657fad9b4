//! Shared test doubles for the capability traits
//!
//! One fake per backend trait, each holding plain in-memory state so
//! multi-device tests can share a single metadata/artifact universe.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::models::{ColumnValue, Operation, OperationKind};
use crate::store::{
    Availability, ChangeReason, MetadataChange, MetadataStore, RemoteStore, SnapshotTransport,
};

/// In-memory remote with scriptable availability and failures
pub struct FakeRemote {
    rows: Mutex<HashMap<(String, String), Vec<ColumnValue>>>,
    executed: Mutex<Vec<Operation>>,
    poisoned_rows: Mutex<HashSet<(String, String)>>,
    execution_budget: Mutex<Option<usize>>,
    fail_reads: AtomicBool,
    availability_tx: watch::Sender<Availability>,
    availability_rx: watch::Receiver<Availability>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let (availability_tx, availability_rx) = watch::channel(Availability::Available);
        Self {
            rows: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            poisoned_rows: Mutex::new(HashSet::new()),
            execution_budget: Mutex::new(None),
            fail_reads: AtomicBool::new(false),
            availability_tx,
            availability_rx,
        }
    }

    pub fn set_available(&self, available: bool) {
        let state = if available {
            Availability::Available
        } else {
            Availability::Unavailable
        };
        self.availability_tx.send_replace(state);
    }

    /// Make `execute` fail permanently (not an availability error) for one row
    pub fn poison_row(&self, table: &str, row_id: &str) {
        self.poisoned_rows
            .lock()
            .unwrap()
            .insert((table.to_string(), row_id.to_string()));
    }

    /// Let `n` more executions succeed, then fail them as unavailable while
    /// still reporting available (a backend that looks up but times out)
    pub fn fail_executions_after(&self, n: usize) {
        *self.execution_budget.lock().unwrap() = Some(n);
    }

    pub fn stop_failing_executions(&self) {
        *self.execution_budget.lock().unwrap() = None;
    }

    /// Make every `read` fail even while reporting available
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Operations successfully executed, in arrival order
    pub fn executed(&self) -> Vec<Operation> {
        self.executed.lock().unwrap().clone()
    }

    pub fn row(&self, table: &str, row_id: &str) -> Option<Vec<ColumnValue>> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), row_id.to_string()))
            .cloned()
    }
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn execute(&self, op: &Operation) -> crate::Result<()> {
        if !self.is_available() {
            return Err(crate::Error::unavailable("fake remote offline"));
        }
        {
            let mut budget = self.execution_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(crate::Error::unavailable("fake remote timing out"));
                }
                *remaining -= 1;
            }
        }
        let key = (op.table.clone(), op.row_id.clone());
        if self.poisoned_rows.lock().unwrap().contains(&key) {
            return Err(crate::Error::Execution(format!(
                "poisoned row {}/{}",
                op.table, op.row_id
            )));
        }

        let mut rows = self.rows.lock().unwrap();
        match op.kind {
            OperationKind::Insert | OperationKind::Update => {
                rows.insert(key, op.data.clone());
            }
            OperationKind::Delete => {
                if op.targets_all_tables() {
                    rows.clear();
                } else if op.targets_all_rows() {
                    rows.retain(|(table, _), _| table != &op.table);
                } else {
                    rows.remove(&key);
                }
            }
        }
        drop(rows);

        self.executed.lock().unwrap().push(op.clone());
        Ok(())
    }

    async fn read(&self, table: &str, row_id: &str) -> crate::Result<Option<Vec<ColumnValue>>> {
        if !self.is_available() {
            return Err(crate::Error::unavailable("fake remote offline"));
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(crate::Error::Execution("simulated read failure".into()));
        }
        Ok(self.row(table, row_id))
    }

    fn watch_availability(&self) -> watch::Receiver<Availability> {
        self.availability_rx.clone()
    }
}

/// In-memory metadata store; notifications are sent explicitly by tests
pub struct FakeMetadata {
    entries: Mutex<BTreeMap<String, String>>,
    changes_tx: broadcast::Sender<MetadataChange>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(16);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changes_tx,
        }
    }

    /// Simulate a pushed change notification
    pub fn notify(&self, reason: ChangeReason, keys: Vec<String>) {
        let _ = self.changes_tx.send(MetadataChange { reason, keys });
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

impl Default for FakeMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for FakeMetadata {
    async fn persist(&self, key: &str, value: &str) -> crate::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn load(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn keys(&self) -> crate::Result<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    fn watch_changes(&self) -> broadcast::Receiver<MetadataChange> {
        self.changes_tx.subscribe()
    }
}

/// In-memory artifact transport
pub struct FakeSnapshots {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    upload_counts: Mutex<HashMap<String, usize>>,
}

impl FakeSnapshots {
    pub fn new() -> Self {
        Self {
            artifacts: Mutex::new(HashMap::new()),
            upload_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.lock().unwrap().contains_key(name)
    }

    /// Drop a published artifact, as if it expired server-side
    pub fn remove(&self, name: &str) {
        self.artifacts.lock().unwrap().remove(name);
    }

    pub fn upload_count(&self, name: &str) -> usize {
        self.upload_counts
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for FakeSnapshots {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotTransport for FakeSnapshots {
    async fn upload(&self, name: &str, source: &Path) -> crate::Result<()> {
        let bytes = std::fs::read(source)?;
        self.artifacts
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
        *self
            .upload_counts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn download(&self, name: &str, dest: &Path) -> crate::Result<()> {
        let bytes = self
            .artifacts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::SnapshotMissing(name.to_string()))?;
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}
