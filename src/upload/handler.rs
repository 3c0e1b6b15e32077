//! Receives bytes for named parts and drives the upload to completion
//!
//! Single-part uploads are the degenerate case: one implicit part equal to
//! the whole archive, verified against `archive.hash`. Multi-part uploads
//! are verified per part against `.parts/upload.json`. Either way, the
//! completing write extracts the archive into `content/`, moves the status
//! `uploading → uploaded` and releases the `upload` lock.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::archive::{self, ArchiveError, ArchiveFormat};
use super::manifest::{ManifestError, ManifestLock, UploadManifest};
use super::merge::{ArchiveMerger, MergeError};
use crate::checksum::{self, Algorithm};
use crate::state::{StoreError, SubmissionStatus, SubmissionStore};
use crate::submission::{is_safe_name, DirectoryError, LockError, LockKind, LogFile, SubmissionDirectory};

/// How long a writer waits for another writer's manifest update.
const MANIFEST_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from receiving upload content
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("part {name} is not expected by the manifest")]
    PartNotExpected { name: String },

    #[error("hash mismatch for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("submission {id} is not accepting uploads: {reason}")]
    NotAccepting { id: String, reason: String },

    #[error("submission {0} has no registered upload")]
    NotRegistered(String),

    #[error("submission {0} already has a registered upload")]
    AlreadyRegistered(String),

    #[error("invalid archive name: {0:?}")]
    InvalidName(String),

    #[error("invalid hash: {0:?}")]
    InvalidHash(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Upload progress after a part was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub received: usize,
    pub expected: usize,
    /// The upload finished and the content was extracted
    pub completed: bool,
}

/// Accepts upload content for submissions.
pub struct UploadHandler {
    store: Arc<dyn SubmissionStore>,
    merger: ArchiveMerger,
}

impl UploadHandler {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self {
            store,
            merger: ArchiveMerger::new(),
        }
    }

    /// Register a single-part upload by recording the archive hash.
    pub fn register_single(&self, dir: &SubmissionDirectory, archive_hash: &str) -> Result<(), UploadError> {
        self.ensure_accepting(dir)?;
        if Algorithm::from_hex(archive_hash.trim()).is_none() {
            return Err(UploadError::InvalidHash(archive_hash.to_string()));
        }
        if dir.archive_hash_path().exists() || dir.is_multipart() {
            return Err(UploadError::AlreadyRegistered(dir.id().to_string()));
        }
        fs::write(dir.archive_hash_path(), archive_hash.trim().to_ascii_lowercase())?;
        Ok(())
    }

    /// Register a multi-part upload by writing its manifest.
    pub fn register_multipart(&self, dir: &SubmissionDirectory, manifest: &UploadManifest) -> Result<(), UploadError> {
        self.ensure_accepting(dir)?;
        manifest.validate()?;
        ArchiveFormat::from_name(&manifest.archive)?;
        if dir.archive_hash_path().exists() || dir.is_multipart() {
            return Err(UploadError::AlreadyRegistered(dir.id().to_string()));
        }
        fs::create_dir_all(dir.parts_dir())?;
        let mut fresh = manifest.clone();
        fresh.received.clear();
        fresh.save(&dir.manifest_path())?;
        tracing::info!(
            submission_id = %dir.id(),
            parts = fresh.parts.len(),
            bytes = fresh.total_size(),
            "Registered multi-part upload"
        );
        Ok(())
    }

    /// Accept bytes for a named part (or the whole archive for single-part).
    ///
    /// `declared_hash`, when given, must agree with the recorded hash.
    pub fn add_content(
        &self,
        dir: &SubmissionDirectory,
        name: &str,
        bytes: &[u8],
        declared_hash: Option<&str>,
    ) -> Result<UploadProgress, UploadError> {
        self.ensure_accepting(dir)?;
        if dir.is_multipart() {
            self.add_part(dir, name, bytes, declared_hash)
        } else if dir.archive_hash_path().is_file() {
            self.add_single(dir, name, bytes, declared_hash)
        } else {
            Err(UploadError::NotRegistered(dir.id().to_string()))
        }
    }

    /// Parts are accepted only while `upload` is held and neither `error` nor `clean` is.
    fn ensure_accepting(&self, dir: &SubmissionDirectory) -> Result<(), UploadError> {
        let reason = if !dir.has_lock(LockKind::Upload) {
            "upload lock not held"
        } else if dir.has_lock(LockKind::Error) {
            "error lock held"
        } else if dir.has_lock(LockKind::Clean) {
            "clean lock held"
        } else {
            return Ok(());
        };
        Err(UploadError::NotAccepting {
            id: dir.id().to_string(),
            reason: reason.to_string(),
        })
    }

    fn add_part(
        &self,
        dir: &SubmissionDirectory,
        name: &str,
        bytes: &[u8],
        declared_hash: Option<&str>,
    ) -> Result<UploadProgress, UploadError> {
        let manifest_path = dir.manifest_path();
        let expected = {
            let manifest = match UploadManifest::load(&manifest_path) {
                Ok(manifest) => manifest,
                Err(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(already_completed(dir));
                }
                Err(e) => return Err(e.into()),
            };
            manifest
                .expected(name)
                .cloned()
                .ok_or_else(|| UploadError::PartNotExpected {
                    name: name.to_string(),
                })?
        };
        check_declared(&expected.name, &expected.hash, declared_hash)?;

        let final_path = dir.parts_dir().join(&expected.name);
        let temp_path = dir.parts_dir().join(temp_name(&expected.name));
        // Another writer may complete the upload, and remove `.parts/`, at any point below.
        match write_verified(&temp_path, &expected.name, &expected.hash, bytes) {
            Err(UploadError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(already_completed(dir));
            }
            other => other?,
        }

        let _guard = match ManifestLock::acquire(&manifest_path, MANIFEST_LOCK_TIMEOUT) {
            Ok(guard) => guard,
            Err(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                let _ = fs::remove_file(&temp_path);
                return Err(already_completed(dir));
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };
        let mut manifest = match UploadManifest::load(&manifest_path) {
            Ok(manifest) => manifest,
            Err(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                let _ = fs::remove_file(&temp_path);
                return Err(already_completed(dir));
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        if manifest.is_received(&expected) {
            let _ = fs::remove_file(&temp_path);
            tracing::debug!(submission_id = %dir.id(), part = %name, "Part already received");
        } else {
            fs::rename(&temp_path, &final_path)?;
            manifest.mark_received(&expected);
            manifest.save(&manifest_path)?;
            tracing::debug!(
                submission_id = %dir.id(),
                part = %name,
                remaining = manifest.remaining_items().len(),
                "Accepted part"
            );
        }

        let mut progress = UploadProgress {
            received: manifest.received.len(),
            expected: manifest.parts.len(),
            completed: false,
        };
        if manifest.completed() {
            self.finish_multipart(dir, &manifest)?;
            progress.completed = true;
        }
        Ok(progress)
    }

    fn finish_multipart(&self, dir: &SubmissionDirectory, manifest: &UploadManifest) -> Result<(), UploadError> {
        match self.merger.merge(manifest, &dir.parts_dir(), &dir.content_dir()) {
            Ok(_) => {}
            Err(e) => {
                if e.is_integrity() || matches!(e, MergeError::Extract(_)) {
                    self.mark_error(dir, &e.to_string())?;
                }
                return Err(e.into());
            }
        }
        dir.append_log(
            LogFile::Submission,
            &format!("merged {} part(s) into {}", manifest.parts.len(), manifest.archive),
        )?;
        self.complete(dir)
    }

    fn add_single(
        &self,
        dir: &SubmissionDirectory,
        name: &str,
        bytes: &[u8],
        declared_hash: Option<&str>,
    ) -> Result<UploadProgress, UploadError> {
        if !is_safe_name(name) {
            return Err(UploadError::InvalidName(name.to_string()));
        }
        let format = ArchiveFormat::from_name(name)?;
        let expected = fs::read_to_string(dir.archive_hash_path())?.trim().to_string();
        check_declared(name, &expected, declared_hash)?;

        let archive_path = dir.path().join(name);
        let temp_path = dir.path().join(temp_name(name));
        write_verified(&temp_path, name, &expected, bytes)?;
        fs::rename(&temp_path, &archive_path)?;

        let partial = dir.content_dir().with_extension("partial");
        if let Err(e) = archive::extract(&archive_path, format, &partial) {
            let _ = fs::remove_dir_all(&partial);
            self.mark_error(dir, &e.to_string())?;
            return Err(e.into());
        }
        if dir.content_dir().exists() {
            fs::remove_dir_all(dir.content_dir())?;
        }
        fs::rename(&partial, dir.content_dir())?;
        fs::remove_file(&archive_path)?;
        dir.append_log(LogFile::Submission, &format!("extracted single-part archive {}", name))?;

        self.complete(dir)?;
        Ok(UploadProgress {
            received: 1,
            expected: 1,
            completed: true,
        })
    }

    /// Record the transition, then drop the upload lock.
    fn complete(&self, dir: &SubmissionDirectory) -> Result<(), UploadError> {
        let current = self.store.get_submission(dir.id())?;
        if current.status != SubmissionStatus::Uploaded {
            self.store.update_status(dir.id(), SubmissionStatus::Uploaded)?;
        }
        dir.lock(LockKind::Upload).release()?;
        tracing::info!(submission_id = %dir.id(), "Upload complete");
        Ok(())
    }

    fn mark_error(&self, dir: &SubmissionDirectory, reason: &str) -> Result<(), UploadError> {
        dir.lock(LockKind::Error).acquire()?;
        dir.append_log(LogFile::Submission, &format!("upload integrity failure: {}", reason))?;
        tracing::error!(submission_id = %dir.id(), reason = %reason, "Upload failed integrity check");
        Ok(())
    }
}

fn already_completed(dir: &SubmissionDirectory) -> UploadError {
    UploadError::NotAccepting {
        id: dir.id().to_string(),
        reason: "upload already completed".to_string(),
    }
}

fn check_declared(name: &str, recorded: &str, declared: Option<&str>) -> Result<(), UploadError> {
    match declared {
        Some(declared) if !checksum::digests_match(recorded, declared) => Err(UploadError::HashMismatch {
            name: name.to_string(),
            expected: recorded.to_string(),
            actual: declared.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Unique scratch name so concurrent writers of the same part never collide.
fn temp_name(name: &str) -> String {
    format!("{}.{}.tmp", name, uuid::Uuid::new_v4().simple())
}

/// Write `bytes` to `path` and verify the digest; the file is removed on mismatch.
fn write_verified(path: &Path, name: &str, expected: &str, bytes: &[u8]) -> Result<(), UploadError> {
    fs::write(path, bytes)?;
    match checksum::verify_file(path, expected) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(actual)) => {
            let _ = fs::remove_file(path);
            Err(UploadError::HashMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            })
        }
        Err(e) => {
            let _ = fs::remove_file(path);
            Err(e.into())
        }
    }
}
