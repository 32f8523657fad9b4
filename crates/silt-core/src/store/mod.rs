//! Store composition layers and the capability traits they build on
//!
//! Backends are plain trait objects chosen at construction time. The traits
//! split along failure domains: the remote tier may be unreachable, the
//! local tier must not fail, snapshot artifacts and sync metadata travel
//! through their own channels.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::models::{ColumnValue, Operation};

mod mirrored;
mod sqlite;
mod synchronized;

pub use mirrored::{ExecuteOutcome, MirroredStore};
pub use sqlite::SqliteStore;
pub use synchronized::{ReconcileSummary, SyncConfig, SynchronizedStore};

/// Reported reachability of the remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

impl Availability {
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// The backend of uncertain availability
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apply one operation
    ///
    /// Returns [`crate::Error::Unavailable`] when the backend cannot be
    /// reached; that is the only error callers treat as recoverable.
    async fn execute(&self, op: &Operation) -> crate::Result<()>;

    /// Read one row; `None` when the row does not exist
    async fn read(&self, table: &str, row_id: &str) -> crate::Result<Option<Vec<ColumnValue>>>;

    /// Last reported reachability, without touching the network
    fn is_available(&self) -> bool {
        self.watch_availability().borrow().is_available()
    }

    /// Confirm the backend is reachable right now
    async fn ensure_available(&self) -> crate::Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(crate::Error::unavailable("remote backend is offline"))
        }
    }

    /// Subscribe to reachability transitions
    fn watch_availability(&self) -> watch::Receiver<Availability>;
}

/// The always-available local tier
///
/// Errors from these methods indicate a broken installation (disk failure,
/// corrupt database) and propagate to the caller.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply one operation
    async fn execute(&self, op: &Operation) -> crate::Result<()>;

    /// Read one row; `None` when the row does not exist
    async fn read(&self, table: &str, row_id: &str) -> crate::Result<Option<Vec<ColumnValue>>>;

    /// Write a consistent full-database snapshot to `dest`
    async fn snapshot_to(&self, dest: &Path) -> crate::Result<()>;

    /// Merge a peer snapshot produced by [`Self::snapshot_to`]
    ///
    /// Rows absent locally are always inserted; existing rows are
    /// overwritten only when the incoming row's `_modified` is strictly
    /// newer than the local one. `newer_than_ms` limits the overwrite scan
    /// to incoming rows modified after that point.
    async fn merge_snapshot(&self, source: &Path, newer_than_ms: i64)
        -> crate::Result<MergeReport>;

    /// Newest `_modified` across every managed table (0 when empty)
    async fn max_modified(&self) -> crate::Result<i64>;
}

/// What a snapshot merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Rows that did not exist locally
    pub inserted: usize,
    /// Local rows replaced by newer incoming rows
    pub overwritten: usize,
    /// Newest `_modified` seen among applied rows (0 when none applied)
    pub max_modified: i64,
}

/// Moves snapshot artifacts between devices
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// Publish the file at `source` under `name`, replacing any prior version
    async fn upload(&self, name: &str, source: &Path) -> crate::Result<()>;

    /// Fetch the artifact `name` into `dest`
    ///
    /// Returns [`crate::Error::SnapshotMissing`] when no such artifact
    /// exists.
    async fn download(&self, name: &str, dest: &Path) -> crate::Result<()>;
}

/// Small shared key-value tier for sync stamps
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Write `value` under `key`, replacing any prior value
    async fn persist(&self, key: &str, value: &str) -> crate::Result<()>;

    /// Read the value under `key`
    async fn load(&self, key: &str) -> crate::Result<Option<String>>;

    /// Every key currently present
    async fn keys(&self) -> crate::Result<Vec<String>>;

    /// Subscribe to change notifications
    fn watch_changes(&self) -> broadcast::Receiver<MetadataChange>;
}

/// Why metadata changed, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// Another device wrote keys
    ServerChange,
    /// First download after connecting
    InitialSync,
    /// The signed-in account changed
    AccountChange,
}

/// One metadata change notification
#[derive(Debug, Clone)]
pub struct MetadataChange {
    pub reason: ChangeReason,
    /// Affected keys; empty means unknown, inspect everything
    pub keys: Vec<String>,
}

/// Stable identity of this installation
pub trait DeviceIdentity: Send + Sync {
    /// Identifier distinguishing this device from its peers
    fn device_id(&self) -> String;

    /// Opaque account token, when signed in
    fn identity_token(&self) -> Option<String>;
}
