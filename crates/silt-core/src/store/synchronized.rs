//! Multi-device reconciliation through published snapshots
//!
//! Each device periodically uploads its whole local database and announces
//! it with a stamp in the metadata store. Peers discover stamps newer than
//! what they have applied, pull the snapshots into scratch files, and merge
//! them row by row under last-writer-wins. There is no coordinator; the
//! metadata store is only a directory of who published what, and when.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};

use super::{ChangeReason, DeviceIdentity, LocalStore, MetadataStore, SnapshotTransport};
use crate::models::{device_from_key, SyncStamp};

/// Default metadata key prefix for sync stamps
pub const DEFAULT_METADATA_PREFIX: &str = "silt.stamp.";

/// Reconciliation settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Metadata keys under this prefix are treated as sync stamps
    pub metadata_prefix: String,
    /// Periodic publish/reconcile interval (default: 60 seconds)
    pub publish_interval: Option<Duration>,
    /// Directory for snapshot scratch files (default: system temp)
    pub scratch_dir: Option<PathBuf>,
}

impl SyncConfig {
    /// Create a configuration with the defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata_prefix: DEFAULT_METADATA_PREFIX.to_string(),
            publish_interval: Some(Duration::from_secs(60)),
            scratch_dir: None,
        }
    }

    /// Namespace stamps under a different prefix
    #[must_use]
    pub fn with_metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = prefix.into();
        self
    }

    /// Set the periodic reconcile interval
    #[must_use]
    pub const fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = Some(interval);
        self
    }

    /// Disable the timer (reconcile on notifications and explicit calls only)
    #[must_use]
    pub const fn without_auto_publish(mut self) -> Self {
        self.publish_interval = None;
        self
    }

    /// Keep snapshot scratch files under `dir` instead of the system temp
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Peer snapshots merged
    pub merged_snapshots: usize,
    /// Rows inserted across all merges
    pub inserted: usize,
    /// Local rows overwritten by newer peer rows
    pub overwritten: usize,
    /// Stamps skipped (malformed, artifact missing, or merge failed)
    pub skipped: usize,
    /// Whether this device published a snapshot afterwards
    pub published: bool,
}

struct ReconcileState {
    /// Newest peer modification this device has applied (Unix ms)
    last_applied: i64,
    /// Stamp from this device's most recent successful publish
    last_published: Option<SyncStamp>,
    /// Whether this device has ever published (drives first-run behavior)
    published_before: bool,
}

/// Store that keeps N devices' local databases convergent
pub struct SynchronizedStore {
    local: Arc<dyn LocalStore>,
    snapshots: Arc<dyn SnapshotTransport>,
    metadata: Arc<dyn MetadataStore>,
    identity: Arc<dyn DeviceIdentity>,
    config: SyncConfig,
    device_id: String,
    snapshot_name: String,
    state: Mutex<ReconcileState>,
}

impl SynchronizedStore {
    /// Open the store and load this device's own stamp, if any
    ///
    /// When the stored stamp was published under a different account
    /// identity, reconciliation starts fresh from the epoch; the new
    /// account's snapshots are all news to this device.
    pub async fn open(
        local: Arc<dyn LocalStore>,
        snapshots: Arc<dyn SnapshotTransport>,
        metadata: Arc<dyn MetadataStore>,
        identity: Arc<dyn DeviceIdentity>,
        config: SyncConfig,
    ) -> crate::Result<Self> {
        let device_id = identity.device_id();
        let snapshot_name = format!("{device_id}.snapshot");
        let own_key = format!("{}{device_id}", config.metadata_prefix);

        let stored = match metadata.load(&own_key).await? {
            Some(raw) => match SyncStamp::decode(&raw) {
                Ok(stamp) => Some(stamp),
                Err(err) => {
                    tracing::warn!("Own stamp under {own_key} is malformed, republishing: {err}");
                    None
                }
            },
            None => None,
        };

        let current_token = identity.identity_token().unwrap_or_default();
        let state = match stored {
            Some(stamp) if stamp.identity_token == current_token => ReconcileState {
                last_applied: stamp.last_modified,
                last_published: Some(stamp),
                published_before: true,
            },
            Some(_) => {
                tracing::info!("Account changed since last publish, resynchronizing from scratch");
                ReconcileState {
                    last_applied: 0,
                    last_published: None,
                    published_before: true,
                }
            }
            None => ReconcileState {
                last_applied: 0,
                last_published: None,
                published_before: false,
            },
        };

        Ok(Self {
            local,
            snapshots,
            metadata,
            identity,
            config,
            device_id,
            snapshot_name,
            state: Mutex::new(state),
        })
    }

    /// Merge every newer peer snapshot, then publish our own if warranted
    pub async fn reconcile(&self) -> crate::Result<ReconcileSummary> {
        self.reconcile_keys(None).await
    }

    /// Reconcile, limited to the stamps under `keys` when a notification
    /// enumerated them; `None` (or an empty list) inspects every key
    pub async fn reconcile_keys(
        &self,
        keys: Option<Vec<String>>,
    ) -> crate::Result<ReconcileSummary> {
        let mut state = self.state.lock().await;
        let mut summary = ReconcileSummary::default();

        if !state.published_before {
            tracing::debug!("First run for device {}, publishing before any merge", self.device_id);
            summary.published = self.publish(&mut state).await;
            return Ok(summary);
        }

        let candidates = match keys {
            Some(keys) if !keys.is_empty() => keys,
            _ => self.metadata.keys().await?,
        };

        let mut stamps = Vec::new();
        for key in candidates {
            let Some(device) = device_from_key(&self.config.metadata_prefix, &key) else {
                continue;
            };
            if device == self.device_id {
                continue;
            }
            let Some(raw) = self.metadata.load(&key).await? else {
                continue;
            };
            match SyncStamp::decode(&raw) {
                Ok(stamp) => {
                    let foreign = stamp.device_id != self.device_id
                        && stamp.snapshot_name != self.snapshot_name;
                    if foreign && stamp.last_modified > state.last_applied {
                        stamps.push(stamp);
                    }
                }
                Err(err) => {
                    tracing::warn!("Skipping malformed sync stamp under {key}: {err}");
                    summary.skipped += 1;
                }
            }
        }
        stamps.sort_by_key(|stamp| stamp.last_modified);

        let mut newest_applied = state.last_applied;
        for stamp in stamps {
            match self.merge_one(&stamp, state.last_applied).await {
                Ok(report) => {
                    tracing::debug!(
                        "Merged snapshot from device {}: {} inserted, {} overwritten",
                        stamp.device_id,
                        report.inserted,
                        report.overwritten
                    );
                    summary.merged_snapshots += 1;
                    summary.inserted += report.inserted;
                    summary.overwritten += report.overwritten;
                    newest_applied = newest_applied
                        .max(stamp.last_modified)
                        .max(report.max_modified);
                }
                Err(err) => {
                    tracing::warn!(
                        "Skipping snapshot from device {}: {err}",
                        stamp.device_id
                    );
                    summary.skipped += 1;
                }
            }
        }
        state.last_applied = newest_applied;

        let local_max = self.local.max_modified().await?;
        let stale = state
            .last_published
            .as_ref()
            .is_none_or(|stamp| local_max > stamp.last_modified);
        if summary.merged_snapshots > 0 || stale {
            summary.published = self.publish(&mut state).await;
        }
        Ok(summary)
    }

    /// Reconcile on metadata change notifications and on the configured
    /// interval, until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.metadata.watch_changes();
        let mut ticker = self.config.publish_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                change = changes.recv() => {
                    let keys = match change {
                        Ok(change) => {
                            if change.reason == ChangeReason::AccountChange {
                                tracing::info!("Metadata reports an account change");
                            }
                            if change.keys.is_empty() { None } else { Some(change.keys) }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Missed {missed} metadata notifications, inspecting every stamp");
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Metadata notification channel closed, stopping");
                            return;
                        }
                    };
                    if let Err(err) = self.reconcile_keys(keys).await {
                        tracing::warn!("Reconciliation after notification failed: {err}");
                    }
                }
                () = Self::tick(&mut ticker) => {
                    if let Err(err) = self.reconcile().await {
                        tracing::warn!("Periodic reconciliation failed: {err}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Identifier of this device among its peers
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Artifact name this device publishes under
    #[must_use]
    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    /// Newest peer modification applied so far (Unix ms)
    pub async fn last_applied(&self) -> i64 {
        self.state.lock().await.last_applied
    }

    // ---------- Private ----------

    async fn tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Pull one peer snapshot into a scratch file and merge it
    ///
    /// The scratch file is deleted when the guard drops, error or not.
    async fn merge_one(
        &self,
        stamp: &SyncStamp,
        newer_than_ms: i64,
    ) -> crate::Result<super::MergeReport> {
        let scratch = self.scratch_file()?;
        self.snapshots
            .download(&stamp.snapshot_name, scratch.path())
            .await?;
        self.local.merge_snapshot(scratch.path(), newer_than_ms).await
    }

    /// Publish the current local database and stamp it
    ///
    /// Failures are absorbed; the stamp in the metadata store still points
    /// at the previous snapshot and the next cycle retries.
    async fn publish(&self, state: &mut ReconcileState) -> bool {
        match self.try_publish(state).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Publishing snapshot failed, will retry next cycle: {err}");
                false
            }
        }
    }

    async fn try_publish(&self, state: &mut ReconcileState) -> crate::Result<()> {
        // Stamp with the content's own recency, not the wall clock: a
        // device that only absorbed peer rows announces nothing newer than
        // what those peers already hold, so publishes cannot ping-pong.
        let last_modified = self.local.max_modified().await?;

        let scratch = self.scratch_file()?;
        self.local.snapshot_to(scratch.path()).await?;
        self.snapshots
            .upload(&self.snapshot_name, scratch.path())
            .await?;

        let stamp = SyncStamp::new(
            self.device_id.clone(),
            self.snapshot_name.clone(),
            last_modified,
            self.identity.identity_token(),
        );
        self.metadata
            .persist(&stamp.key(&self.config.metadata_prefix), &stamp.encode()?)
            .await?;

        tracing::debug!(
            "Published snapshot {} with last_modified {last_modified}",
            self.snapshot_name
        );
        state.published_before = true;
        // Our own content counts as applied; a reopen would load this stamp
        // and start from the same point.
        state.last_applied = state.last_applied.max(last_modified);
        state.last_published = Some(stamp);
        Ok(())
    }

    fn scratch_file(&self) -> crate::Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("silt-snapshot-").suffix(".db");
        let scratch = match &self.config.scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(scratch)
    }
}
