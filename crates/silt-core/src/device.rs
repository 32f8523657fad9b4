//! Device identity providers

use std::fs;
use std::path::Path;

use crate::store::DeviceIdentity;

/// Identity backed by an id file, generated on first use
///
/// The id is a UUIDv7 written next to the application's data. Reopening the
/// same path yields the same identity for the lifetime of the installation.
/// Any non-empty file content is honored as-is, so migrated installations
/// keep their historical ids.
#[derive(Debug, Clone)]
pub struct StoredDeviceId {
    device_id: String,
    identity_token: Option<String>,
}

impl StoredDeviceId {
    /// Read the id at `path`, generating and persisting one if absent
    pub fn load_or_create(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let existing = match fs::read_to_string(path) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let device_id = match existing {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::now_v7().to_string();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, &id)?;
                tracing::info!("Generated device id {} at {}", id, path.display());
                id
            }
        };

        Ok(Self {
            device_id,
            identity_token: None,
        })
    }

    /// Attach the account token in effect for this session
    #[must_use]
    pub fn with_identity_token(mut self, token: impl Into<String>) -> Self {
        self.identity_token = Some(token.into());
        self
    }
}

impl DeviceIdentity for StoredDeviceId {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn identity_token(&self) -> Option<String> {
        self.identity_token.clone()
    }
}

/// Identity with explicit values; deterministic for tests
#[derive(Debug, Clone)]
pub struct FixedIdentity {
    device_id: String,
    identity_token: Option<String>,
}

impl FixedIdentity {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            identity_token: None,
        }
    }

    /// Attach the account token in effect for this session
    #[must_use]
    pub fn with_identity_token(mut self, token: impl Into<String>) -> Self {
        self.identity_token = Some(token.into());
        self
    }
}

impl DeviceIdentity for FixedIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn identity_token(&self) -> Option<String> {
        self.identity_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn generates_once_and_stays_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("device-id");

        let first = StoredDeviceId::load_or_create(&path).unwrap();
        assert!(uuid::Uuid::parse_str(&first.device_id()).is_ok());

        let second = StoredDeviceId::load_or_create(&path).unwrap();
        assert_eq!(second.device_id(), first.device_id());
    }

    #[test]
    fn honors_preexisting_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device-id");
        std::fs::write(&path, "legacy-device-7\n").unwrap();

        let identity = StoredDeviceId::load_or_create(&path).unwrap();
        assert_eq!(identity.device_id(), "legacy-device-7");
    }

    #[test]
    fn fixed_identity_returns_exactly_what_it_was_given() {
        let identity = FixedIdentity::new("device-a").with_identity_token("acct-1");
        assert_eq!(identity.device_id(), "device-a");
        assert_eq!(identity.identity_token(), Some("acct-1".to_string()));
        assert_eq!(FixedIdentity::new("device-b").identity_token(), None);
    }
}
