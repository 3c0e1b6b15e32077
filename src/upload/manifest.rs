//! Multi-part upload manifest (`.parts/upload.json`)
//!
//! The manifest lists the parts the server authorized (name, size, hash)
//! and the parts received so far. It is rewritten after every mutation so
//! an interrupted process resumes exactly where it stopped.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::Algorithm;
use crate::submission::{is_safe_name, MANIFEST_FILE};

/// Schema version for upload.json
pub const SCHEMA_VERSION: u32 = 1;

/// Errors for manifest operations
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest lists no parts")]
    Empty,

    #[error("invalid archive name: {0:?}")]
    InvalidArchiveName(String),

    #[error("invalid part name: {0:?}")]
    InvalidPartName(String),

    #[error("duplicate part name: {0}")]
    DuplicatePart(String),

    #[error("invalid hash for {name}: {hash:?}")]
    InvalidHash { name: String, hash: String },

    #[error("timed out waiting for manifest lock after {0:?}")]
    LockTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One expected (or received) part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    pub name: String,
    pub size: u64,
    pub hash: String,
}

impl PartEntry {
    pub fn new(name: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            hash: hash.into().to_ascii_lowercase(),
        }
    }

    fn same_part(&self, other: &PartEntry) -> bool {
        self.name == other.name && self.hash.eq_ignore_ascii_case(&other.hash)
    }
}

/// Expected vs. received parts of a multi-part upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// File name of the reconstructed archive
    pub archive: String,
    /// Hash of the whole archive, recorded at submission creation
    pub archive_hash: String,
    /// Expected parts, in concatenation order
    pub parts: Vec<PartEntry>,
    /// Parts received and verified so far
    #[serde(default)]
    pub received: Vec<PartEntry>,
    /// Hash the merged file must have; defaults to `archive_hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_hash: Option<String>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn valid_hash(hash: &str) -> bool {
    Algorithm::from_hex(hash).is_some()
}

impl UploadManifest {
    /// Create and validate a manifest with nothing received.
    pub fn new(
        archive: impl Into<String>,
        archive_hash: impl Into<String>,
        parts: Vec<PartEntry>,
    ) -> Result<Self, ManifestError> {
        let manifest = Self {
            schema_version: SCHEMA_VERSION,
            archive: archive.into(),
            archive_hash: archive_hash.into().to_ascii_lowercase(),
            parts,
            received: Vec::new(),
            merge_hash: None,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check names, hashes and the `received ⊆ expected` invariant.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_safe_name(&self.archive) {
            return Err(ManifestError::InvalidArchiveName(self.archive.clone()));
        }
        if !valid_hash(&self.archive_hash) {
            return Err(ManifestError::InvalidHash {
                name: self.archive.clone(),
                hash: self.archive_hash.clone(),
            });
        }
        if let Some(merge_hash) = &self.merge_hash {
            if !valid_hash(merge_hash) {
                return Err(ManifestError::InvalidHash {
                    name: self.archive.clone(),
                    hash: merge_hash.clone(),
                });
            }
        }
        if self.parts.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut seen = HashSet::new();
        for part in &self.parts {
            if !is_safe_name(&part.name) || part.name == MANIFEST_FILE || part.name == self.archive {
                return Err(ManifestError::InvalidPartName(part.name.clone()));
            }
            if !seen.insert(part.name.as_str()) {
                return Err(ManifestError::DuplicatePart(part.name.clone()));
            }
            if !valid_hash(&part.hash) {
                return Err(ManifestError::InvalidHash {
                    name: part.name.clone(),
                    hash: part.hash.clone(),
                });
            }
        }

        let mut seen_received = HashSet::new();
        for part in &self.received {
            if !self.parts.iter().any(|p| p.same_part(part)) {
                return Err(ManifestError::InvalidPartName(part.name.clone()));
            }
            if !seen_received.insert(part.name.as_str()) {
                return Err(ManifestError::DuplicatePart(part.name.clone()));
            }
        }
        Ok(())
    }

    /// Expected entry for a part name.
    pub fn expected(&self, name: &str) -> Option<&PartEntry> {
        self.parts.iter().find(|p| p.name == name)
    }

    /// Whether a part with this name and hash has been received.
    pub fn is_received(&self, part: &PartEntry) -> bool {
        self.received.iter().any(|r| r.same_part(part))
    }

    /// Expected parts not yet received.
    pub fn remaining_items(&self) -> Vec<&PartEntry> {
        self.parts.iter().filter(|p| !self.is_received(p)).collect()
    }

    /// All expected parts received.
    pub fn completed(&self) -> bool {
        self.received.len() == self.parts.len()
    }

    /// Hash the merged archive must match.
    pub fn merge_target(&self) -> &str {
        self.merge_hash.as_deref().unwrap_or(&self.archive_hash)
    }

    /// Record a verified part. Returns `false` if it was already recorded.
    pub(crate) fn mark_received(&mut self, part: &PartEntry) -> bool {
        if self.is_received(part) {
            return false;
        }
        self.received.push(part.clone());
        true
    }

    /// Total expected bytes.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let json = fs::read_to_string(path)?;
        let manifest: UploadManifest = serde_json::from_str(&json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write atomically to file (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Short-lived exclusive lock serializing read-modify-write of one manifest.
///
/// Released on drop.
pub(crate) struct ManifestLock {
    path: PathBuf,
}

impl ManifestLock {
    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    pub(crate) fn acquire(manifest_path: &Path, timeout: Duration) -> Result<Self, ManifestError> {
        let path = manifest_path.with_extension("json.lock");
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(ManifestError::LockTimeout(timeout));
                    }
                    std::thread::sleep(Self::POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const H1: &str = "11111111111111111111111111111111";
    const H2: &str = "22222222222222222222222222222222";
    const H3: &str = "33333333333333333333333333333333";
    const HA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn manifest() -> UploadManifest {
        UploadManifest::new(
            "archive.tar",
            HA,
            vec![
                PartEntry::new("part-0", 10, H1),
                PartEntry::new("part-1", 10, H2),
                PartEntry::new("part-2", 5, H3),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_completed_iff_nothing_remaining() {
        let mut m = manifest();
        assert!(!m.completed());
        assert_eq!(m.remaining_items().len(), 3);

        let parts = m.parts.clone();
        // Arrival order does not matter
        for part in [&parts[2], &parts[0], &parts[1]] {
            assert_eq!(m.completed(), m.remaining_items().is_empty());
            m.mark_received(part);
        }
        assert!(m.completed());
        assert!(m.remaining_items().is_empty());
    }

    #[test]
    fn test_mark_received_idempotent() {
        let mut m = manifest();
        let part = m.parts[1].clone();
        assert!(m.mark_received(&part));
        let remaining = m.remaining_items().len();
        assert!(!m.mark_received(&part));
        assert_eq!(m.remaining_items().len(), remaining);
        assert_eq!(m.received.len(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_manifests() {
        assert!(matches!(
            UploadManifest::new("a.tar", HA, vec![]),
            Err(ManifestError::Empty)
        ));
        assert!(matches!(
            UploadManifest::new("a.tar", HA, vec![PartEntry::new("../x", 1, H1)]),
            Err(ManifestError::InvalidPartName(_))
        ));
        assert!(matches!(
            UploadManifest::new("a.tar", HA, vec![PartEntry::new("upload.json", 1, H1)]),
            Err(ManifestError::InvalidPartName(_))
        ));
        assert!(matches!(
            UploadManifest::new(
                "a.tar",
                HA,
                vec![PartEntry::new("p", 1, H1), PartEntry::new("p", 1, H2)]
            ),
            Err(ManifestError::DuplicatePart(_))
        ));
        assert!(matches!(
            UploadManifest::new("a.tar", HA, vec![PartEntry::new("p", 1, "nothex")]),
            Err(ManifestError::InvalidHash { .. })
        ));
        assert!(matches!(
            UploadManifest::new("a/b.tar", HA, vec![PartEntry::new("p", 1, H1)]),
            Err(ManifestError::InvalidArchiveName(_))
        ));
    }

    #[test]
    fn test_save_and_load_resume_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.json");

        let mut m = manifest();
        let part = m.parts[0].clone();
        m.mark_received(&part);
        m.save(&path).unwrap();

        let loaded = UploadManifest::load(&path).unwrap();
        assert_eq!(loaded, m);
        assert_eq!(loaded.remaining_items().len(), 2);
        assert!(!dir.path().join("upload.json.tmp").exists());
    }

    #[test]
    fn test_load_rejects_foreign_received_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.json");

        let mut m = manifest();
        m.received.push(PartEntry::new("part-0", 10, H2));
        fs::write(&path, serde_json::to_string(&m).unwrap()).unwrap();

        assert!(UploadManifest::load(&path).is_err());
    }

    #[test]
    fn test_merge_target_defaults_to_archive_hash() {
        let mut m = manifest();
        assert_eq!(m.merge_target(), HA);
        m.merge_hash = Some(H1.to_string());
        assert_eq!(m.merge_target(), H1);
    }

    #[test]
    fn test_manifest_lock_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.json");

        let lock = ManifestLock::acquire(&path, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            ManifestLock::acquire(&path, Duration::from_millis(50)),
            Err(ManifestError::LockTimeout(_))
        ));
        drop(lock);
        ManifestLock::acquire(&path, Duration::from_millis(50)).unwrap();
    }
}
