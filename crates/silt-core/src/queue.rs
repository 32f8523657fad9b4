//! Durable operation log
//!
//! One JSON file per queued operation. Entry identifiers start with a
//! fixed-width UTC millisecond timestamp, so sorting file names ascending
//! replays operations in issuance order; a UUIDv7 suffix keeps entries from
//! the same millisecond distinct. Entries that fail replay for reasons other
//! than connectivity are moved to a `dead/` subdirectory instead of being
//! discarded.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::Operation;

/// Current entry envelope version; bump on incompatible layout changes
pub const ENTRY_SCHEMA_VERSION: u32 = 1;

const ENTRY_EXTENSION: &str = "json";
const DEAD_DIR: &str = "dead";

/// Identifier of one queued operation; lexicographic order is issuance order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(String);

impl EntryId {
    /// Build an identifier for an operation issued at `timestamp_ms`
    fn generate(timestamp_ms: i64) -> crate::Result<Self> {
        let issued = chrono::DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            crate::Error::InvalidInput(format!(
                "operation timestamp out of range: {timestamp_ms}"
            ))
        })?;
        let stamp = issued.format("%Y%m%dT%H%M%S%.3fZ");
        Ok(Self(format!("{stamp}_{}", uuid::Uuid::now_v7())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-disk envelope around a queued operation
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    version: u32,
    op: Operation,
}

/// Durable FIFO of operations awaiting replay against the remote backend
#[derive(Debug)]
pub struct OperationLog {
    dir: PathBuf,
    dead_dir: PathBuf,
    pending: usize,
}

impl OperationLog {
    /// Open (creating if needed) the log rooted at `dir`
    ///
    /// Counts surviving entries and clears temp files left by interrupted
    /// writes.
    pub fn open(dir: impl Into<PathBuf>) -> crate::Result<Self> {
        let dir = dir.into();
        let dead_dir = dir.join(DEAD_DIR);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&dead_dir)?;

        let mut pending = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(ENTRY_EXTENSION) => pending += 1,
                Some("tmp") => {
                    tracing::debug!("Removing interrupted queue write: {}", path.display());
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }

        Ok(Self {
            dir,
            dead_dir,
            pending,
        })
    }

    /// Append an operation; returns its identifier
    pub fn enqueue(&mut self, op: Operation) -> crate::Result<EntryId> {
        op.validate()?;
        let id = EntryId::generate(op.timestamp)?;
        let entry = StoredEntry {
            version: ENTRY_SCHEMA_VERSION,
            op,
        };
        let payload = serde_json::to_vec(&entry)?;

        let path = self.entry_path(&id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;

        self.pending += 1;
        Ok(id)
    }

    /// Pending entries in issuance order
    ///
    /// Entries stay queued until [`Self::dequeue`]d. Corrupt entries are
    /// skipped with a warning and never abort the listing.
    pub fn drain(&self) -> crate::Result<Vec<(EntryId, Operation)>> {
        Self::list(&self.dir)
    }

    /// Remove a replayed entry; removing it twice is not an error
    pub fn dequeue(&mut self, id: &EntryId) -> crate::Result<()> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => {
                self.pending = self.pending.saturating_sub(1);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Move an entry whose replay failed permanently into `dead/`
    pub fn dead_letter(&mut self, id: &EntryId) -> crate::Result<()> {
        let source = self.entry_path(id);
        let target = self.dead_dir.join(source.file_name().unwrap_or_default());
        match fs::rename(&source, &target) {
            Ok(()) => {
                self.pending = self.pending.saturating_sub(1);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Dead-lettered entries in issuance order, for inspection
    pub fn dead_letters(&self) -> crate::Result<Vec<(EntryId, Operation)>> {
        Self::list(&self.dead_dir)
    }

    /// `(table, row_id)` of every pending entry; rebuilds dirty tracking
    pub fn pending_rows(&self) -> crate::Result<Vec<(String, String)>> {
        Ok(self
            .drain()?
            .into_iter()
            .map(|(_, op)| (op.table, op.row_id))
            .collect())
    }

    /// Number of pending entries
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pending == 0
    }

    // ---------- Private ----------

    fn entry_path(&self, id: &EntryId) -> PathBuf {
        self.dir.join(format!("{id}.{ENTRY_EXTENSION}"))
    }

    fn list(dir: &Path) -> crate::Result<Vec<(EntryId, Operation)>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_entry = path.is_file()
                && path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION);
            if !is_entry {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort_unstable();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(format!("{name}.{ENTRY_EXTENSION}"));
            match Self::read_entry(&path) {
                Ok(op) => entries.push((EntryId(name), op)),
                Err(err) => {
                    tracing::warn!("Skipping corrupt queue entry {}: {}", path.display(), err);
                }
            }
        }
        Ok(entries)
    }

    fn read_entry(path: &Path) -> crate::Result<Operation> {
        let raw = fs::read(path)?;
        let entry: StoredEntry = serde_json::from_slice(&raw)?;
        if entry.version != ENTRY_SCHEMA_VERSION {
            return Err(crate::Error::InvalidInput(format!(
                "unsupported queue entry version {} (expected {ENTRY_SCHEMA_VERSION})",
                entry.version
            )));
        }
        entry.op.validate()?;
        Ok(entry.op)
    }
}
