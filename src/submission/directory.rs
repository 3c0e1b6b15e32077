//! On-disk layout of one submission
//!
//! ```text
//! <submission_root>/<submission_id>/
//!   info.json
//!   upload.lock | eval.lock | error.lock | interrupted.lock | clean.lock
//!   .parts/upload.json
//!   .parts/<part files>
//!   archive.hash
//!   content/
//!   content/scores/
//!   submission.log, evaluation.log, slurm.log
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use super::info::SubmissionInfo;
use super::is_safe_name;
use super::lock::{Lock, LockError, LockKind};
use crate::state::SubmissionStatus;

/// Errors from submission directory operations
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid submission id: {0:?}")]
    InvalidId(String),

    #[error("submission directory not found: {0}")]
    NotFound(PathBuf),

    #[error("submission directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("submission is in non-terminal status {0}; refusing to remove")]
    NotTerminal(SubmissionStatus),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-submission log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFile {
    /// Upload, merge and transfer diagnostics
    Submission,
    /// Evaluator stdout/stderr
    Evaluation,
    /// Batch-scheduler output
    Slurm,
}

impl LogFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            LogFile::Submission => "submission.log",
            LogFile::Evaluation => "evaluation.log",
            LogFile::Slurm => "slurm.log",
        }
    }
}

/// Name of the staging area for multi-part uploads.
pub const PARTS_DIR: &str = ".parts";
/// Name of the multi-part manifest inside the staging area.
pub const MANIFEST_FILE: &str = "upload.json";
/// Name of the single-part hash file.
pub const ARCHIVE_HASH_FILE: &str = "archive.hash";
/// Name of the extracted content area.
pub const CONTENT_DIR: &str = "content";

/// One submission's directory, exclusively owned by the relay.
#[derive(Debug, Clone)]
pub struct SubmissionDirectory {
    id: String,
    path: PathBuf,
}

impl SubmissionDirectory {
    /// Create the directory, write `info.json` and take the `upload` lock.
    pub fn create(root: &Path, info: &SubmissionInfo) -> Result<Self, DirectoryError> {
        if !is_safe_name(&info.id) {
            return Err(DirectoryError::InvalidId(info.id.clone()));
        }
        fs::create_dir_all(root)?;
        let path = root.join(&info.id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DirectoryError::AlreadyExists(path))
            }
            Err(e) => return Err(e.into()),
        }

        let dir = Self {
            id: info.id.clone(),
            path,
        };
        info.write_once(&dir.info_path())?;
        dir.lock(LockKind::Upload).acquire()?;
        tracing::debug!(submission_id = %dir.id, path = %dir.path.display(), "Created submission directory");
        Ok(dir)
    }

    /// Attach to an existing directory.
    pub fn open(root: &Path, id: &str) -> Result<Self, DirectoryError> {
        if !is_safe_name(id) {
            return Err(DirectoryError::InvalidId(id.to_string()));
        }
        let path = root.join(id);
        if !path.is_dir() {
            return Err(DirectoryError::NotFound(path));
        }
        Ok(Self {
            id: id.to_string(),
            path,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info_path(&self) -> PathBuf {
        self.path.join("info.json")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.path.join(CONTENT_DIR)
    }

    pub fn scores_dir(&self) -> PathBuf {
        self.content_dir().join("scores")
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.path.join(PARTS_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.parts_dir().join(MANIFEST_FILE)
    }

    pub fn archive_hash_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_HASH_FILE)
    }

    pub fn log_path(&self, log: LogFile) -> PathBuf {
        self.path.join(log.file_name())
    }

    /// Whether this submission was registered as a multi-part upload.
    pub fn is_multipart(&self) -> bool {
        self.manifest_path().is_file()
    }

    /// Read `info.json`.
    pub fn info(&self) -> Result<SubmissionInfo, DirectoryError> {
        Ok(SubmissionInfo::read(&self.info_path())?)
    }

    /// Handle to one of this submission's locks.
    pub fn lock(&self, kind: LockKind) -> Lock {
        Lock::new(&self.path, kind)
    }

    pub fn has_lock(&self, kind: LockKind) -> bool {
        self.lock(kind).held()
    }

    /// Locks currently held.
    pub fn held_locks(&self) -> Vec<LockKind> {
        LockKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.has_lock(*kind))
            .collect()
    }

    /// Remove every lock unconditionally. Returns the locks that were held.
    pub fn reset(&self) -> Result<Vec<LockKind>, DirectoryError> {
        let mut cleared = Vec::new();
        for kind in LockKind::ALL {
            if self.lock(kind).release()? {
                cleared.push(kind);
            }
        }
        if !cleared.is_empty() {
            let names: Vec<String> = cleared.iter().map(|k| k.to_string()).collect();
            self.append_log(LogFile::Submission, &format!("reset cleared locks: {}", names.join(", ")))?;
            tracing::warn!(submission_id = %self.id, locks = ?cleared, "Reset submission locks");
        }
        Ok(cleared)
    }

    /// Append timestamped lines to one of the submission logs.
    pub fn append_log(&self, log: LogFile, text: &str) -> Result<(), DirectoryError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(log))?;
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        for line in text.lines() {
            writeln!(file, "[{}] {}", stamp, line)?;
        }
        Ok(())
    }

    /// Delete the directory; allowed only once the submission is terminal.
    pub fn remove_if_terminal(self, status: SubmissionStatus) -> Result<(), DirectoryError> {
        if !status.is_terminal() {
            return Err(DirectoryError::NotTerminal(status));
        }
        let clean = self.lock(LockKind::Clean);
        clean.acquire()?;
        fs::remove_dir_all(&self.path)?;
        tracing::info!(submission_id = %self.id, "Removed submission directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(id: &str) -> SubmissionInfo {
        SubmissionInfo::new(id, "user-1", "bench-1", "model-1")
    }

    #[test]
    fn test_create_writes_info_and_upload_lock() {
        let root = TempDir::new().unwrap();
        let dir = SubmissionDirectory::create(root.path(), &info("s1")).unwrap();

        assert!(dir.info_path().is_file());
        assert!(dir.has_lock(LockKind::Upload));
        assert_eq!(dir.held_locks(), vec![LockKind::Upload]);
        assert_eq!(dir.info().unwrap().benchmark_id, "bench-1");
    }

    #[test]
    fn test_create_twice_fails() {
        let root = TempDir::new().unwrap();
        SubmissionDirectory::create(root.path(), &info("s1")).unwrap();
        assert!(matches!(
            SubmissionDirectory::create(root.path(), &info("s1")),
            Err(DirectoryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let root = TempDir::new().unwrap();
        for id in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                SubmissionDirectory::open(root.path(), id),
                Err(DirectoryError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn test_reset_clears_all_locks() {
        let root = TempDir::new().unwrap();
        let dir = SubmissionDirectory::create(root.path(), &info("s1")).unwrap();
        dir.lock(LockKind::Eval).acquire().unwrap();
        dir.lock(LockKind::Error).acquire().unwrap();

        let cleared = dir.reset().unwrap();
        assert_eq!(cleared, vec![LockKind::Upload, LockKind::Eval, LockKind::Error]);
        assert!(dir.held_locks().is_empty());

        let log = fs::read_to_string(dir.log_path(LogFile::Submission)).unwrap();
        assert!(log.contains("reset cleared locks: upload, eval, error"));
    }

    #[test]
    fn test_remove_only_when_terminal() {
        let root = TempDir::new().unwrap();
        let dir = SubmissionDirectory::create(root.path(), &info("s1")).unwrap();

        let err = dir.clone().remove_if_terminal(SubmissionStatus::Evaluating).unwrap_err();
        assert!(matches!(err, DirectoryError::NotTerminal(_)));
        assert!(dir.path().exists());

        let path = dir.path().to_path_buf();
        dir.remove_if_terminal(SubmissionStatus::Completed).unwrap();
        assert!(!path.exists());
    }
}
