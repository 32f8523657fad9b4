//! Device sync stamps published through the metadata store

use serde::{Deserialize, Serialize};

use crate::models::operation::now_ms;

/// Current stamp schema version; bump on incompatible layout changes
pub const STAMP_SCHEMA_VERSION: u32 = 1;

/// A device's claim about the freshness of its published snapshot
///
/// Each device writes exactly one stamp under `<prefix><device_id>` after
/// publishing a snapshot. Peers list stamps under the prefix to discover
/// which snapshots exist and whether they contain anything new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStamp {
    /// Stamp layout version
    pub version: u32,
    /// Device that published the snapshot
    pub device_id: String,
    /// Artifact name the snapshot was uploaded under
    pub snapshot_name: String,
    /// Newest `_modified` value contained in the snapshot (Unix ms)
    pub last_modified: i64,
    /// Account identity in effect at publication; empty when none
    #[serde(default)]
    pub identity_token: String,
    /// When the stamp was written (Unix ms)
    pub published_at: i64,
}

impl SyncStamp {
    /// Create a stamp for a snapshot whose newest row is `last_modified`
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        snapshot_name: impl Into<String>,
        last_modified: i64,
        identity_token: Option<String>,
    ) -> Self {
        Self {
            version: STAMP_SCHEMA_VERSION,
            device_id: device_id.into(),
            snapshot_name: snapshot_name.into(),
            last_modified,
            identity_token: identity_token.unwrap_or_default(),
            published_at: now_ms(),
        }
    }

    /// Metadata key this stamp is stored under
    #[must_use]
    pub fn key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.device_id)
    }

    /// Serialize for the metadata store
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stamp read back from the metadata store
    ///
    /// Rejects stamps written by an incompatible layout version; callers
    /// treat that the same as a malformed stamp and skip the device.
    pub fn decode(raw: &str) -> crate::Result<Self> {
        let stamp: Self = serde_json::from_str(raw)?;
        if stamp.version != STAMP_SCHEMA_VERSION {
            return Err(crate::Error::InvalidInput(format!(
                "unsupported stamp version {} (expected {STAMP_SCHEMA_VERSION})",
                stamp.version
            )));
        }
        Ok(stamp)
    }
}

/// Extract the device id from a stamp key, if the key belongs to `prefix`
#[must_use]
pub fn device_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|device| !device.is_empty())
}
