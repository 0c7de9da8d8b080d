//! Policy persistence: zen configuration and per-channel ranking
//! configuration in one document.
//!
//! Writes are atomic: serialize to a sibling temp file, then rename over the
//! target. A failed write leaves the previous document on disk untouched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use herald_core::CoreError;

use crate::ranking::RankingConfig;
use crate::zen::ZenConfig;

const POLICY_VERSION: u32 = 1;

/// The persisted policy state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub zen: ZenConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
}

fn default_version() -> u32 {
    POLICY_VERSION
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            zen: ZenConfig::default(),
            ranking: RankingConfig::default(),
        }
    }
}

/// Reads and writes the policy document. With no path configured every
/// operation is a no-op and the pipeline runs unpersisted.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: Option<PathBuf>,
}

impl PolicyStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Loads the document; a missing file yields the defaults.
    pub fn load(&self) -> Result<PolicyDocument, CoreError> {
        let Some(path) = &self.path else {
            return Ok(PolicyDocument::default());
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let doc: PolicyDocument =
                    toml::from_str(&raw).map_err(|e| CoreError::Internal(format!(
                        "policy document at {path:?} is corrupt: {e}"
                    )))?;
                Ok(doc)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "no policy file yet, starting from defaults");
                Ok(PolicyDocument::default())
            }
            Err(source) => Err(CoreError::Filesystem {
                message: "failed to read policy file".into(),
                path: path.clone(),
                source,
            }),
        }
    }

    /// Atomically replaces the on-disk document.
    pub fn save(&self, doc: &PolicyDocument) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = toml::to_string_pretty(doc)
            .map_err(|e| CoreError::Internal(format!("policy serialization failed: {e}")))?;
        write_atomically(path, raw.as_bytes())
    }

    /// The document as an opaque payload for host backup.
    pub fn backup_payload(doc: &PolicyDocument) -> Result<Vec<u8>, CoreError> {
        toml::to_string_pretty(doc)
            .map(String::into_bytes)
            .map_err(|e| CoreError::Internal(format!("policy serialization failed: {e}")))
    }

    pub fn restore_payload(payload: &[u8]) -> Result<PolicyDocument, CoreError> {
        let raw = std::str::from_utf8(payload)
            .map_err(|e| CoreError::Internal(format!("backup payload is not UTF-8: {e}")))?;
        toml::from_str(raw)
            .map_err(|e| CoreError::Internal(format!("backup payload is corrupt: {e}")))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| CoreError::Filesystem {
                message: "failed to create policy directory".into(),
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    let tmp = path.with_extension("tmp");
    if let Err(source) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CoreError::Filesystem {
            message: "failed to write policy temp file".into(),
            path: tmp,
            source,
        });
    }
    if let Err(source) = std::fs::rename(&tmp, path) {
        // The previous document is still live; clean up the temp file.
        warn!(?path, "policy rename failed, keeping previous document");
        let _ = std::fs::remove_file(&tmp);
        return Err(CoreError::Filesystem {
            message: "failed to replace policy file".into(),
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Importance, InterruptionFilter, NotificationChannel, UserId};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_document() -> PolicyDocument {
        let mut doc = PolicyDocument::default();
        doc.zen.interruption_filter = InterruptionFilter::Priority;
        doc.ranking.create_channel(
            "com.example",
            UserId(0),
            NotificationChannel::new("chat", "Chat", Importance::High),
        );
        doc.ranking
            .set_package_importance("com.blocked", UserId(0), Some(Importance::None));
        doc
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(Some(dir.path().join("policy.toml")));
        assert_eq!(store.load().unwrap(), PolicyDocument::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(Some(dir.path().join("policy.toml")));
        let doc = sample_document();
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), doc);
        // No temp file left behind.
        assert!(!dir.path().join("policy.tmp").exists());
    }

    #[test]
    fn save_creates_missing_parent() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(Some(dir.path().join("nested/deeper/policy.toml")));
        store.save(&sample_document()).unwrap();
        assert!(store.load().unwrap().ranking.channel("com.example", UserId(0), "chat").is_some());
    }

    #[test]
    fn failed_write_keeps_previous_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        let store = PolicyStore::new(Some(path.clone()));
        store.save(&sample_document()).unwrap();

        // Make the target a directory so the rename must fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, toml::to_string_pretty(&sample_document()).unwrap()).unwrap();
        let blocked = PolicyStore::new(Some(dir.path().join("policy.toml/inner.toml")));
        assert!(blocked.save(&PolicyDocument::default()).is_err());

        // Original document still loads.
        assert_eq!(store.load().unwrap(), sample_document());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "not really toml [").unwrap();
        let store = PolicyStore::new(Some(path));
        assert!(store.load().is_err());
    }

    #[test]
    fn unpersisted_store_is_a_noop() {
        let store = PolicyStore::new(None);
        assert!(!store.is_persistent());
        store.save(&sample_document()).unwrap();
        assert_eq!(store.load().unwrap(), PolicyDocument::default());
    }

    #[test]
    fn backup_payload_round_trip() {
        let doc = sample_document();
        let payload = PolicyStore::backup_payload(&doc).unwrap();
        let restored = PolicyStore::restore_payload(&payload).unwrap();
        assert_eq!(restored, doc);
    }
}
