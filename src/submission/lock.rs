//! Lock files scoped to one submission directory
//!
//! A lock file's presence is the lock. Acquisition goes through
//! `create_new` so two processes racing for the same lock cannot both
//! believe they created it; release is an idempotent unlink.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0} lock is already held")]
    Held(LockKind),

    #[error("I/O error on lock file: {0}")]
    Io(#[from] io::Error),
}

/// The fixed set of per-submission locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Upload in progress; parts are accepted only while held
    Upload,
    /// Evaluation dispatched and not yet reconciled
    Eval,
    /// Integrity failure; needs operator intervention
    Error,
    /// A worker stopped while evaluating this submission
    Interrupted,
    /// Submission is being cleaned up
    Clean,
}

impl LockKind {
    /// All lock kinds, in a stable order.
    pub const ALL: [LockKind; 5] = [
        LockKind::Upload,
        LockKind::Eval,
        LockKind::Error,
        LockKind::Interrupted,
        LockKind::Clean,
    ];

    /// Lock file name inside the submission directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            LockKind::Upload => "upload.lock",
            LockKind::Eval => "eval.lock",
            LockKind::Error => "error.lock",
            LockKind::Interrupted => "interrupted.lock",
            LockKind::Clean => "clean.lock",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LockKind::Upload => "upload",
            LockKind::Eval => "eval",
            LockKind::Error => "error",
            LockKind::Interrupted => "interrupted",
            LockKind::Clean => "clean",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to one lock file.
#[derive(Debug, Clone)]
pub struct Lock {
    kind: LockKind,
    path: PathBuf,
}

impl Lock {
    /// Create a handle for `kind` inside `dir`. Does not touch the filesystem.
    pub fn new(dir: &Path, kind: LockKind) -> Self {
        Self {
            kind,
            path: dir.join(kind.file_name()),
        }
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock file exists.
    pub fn held(&self) -> bool {
        self.path.exists()
    }

    /// Acquire the lock, treating an existing lock as success.
    ///
    /// Returns `true` when this call created the lock file.
    pub fn acquire(&self) -> LockResult<bool> {
        match self.try_acquire_exclusive() {
            Ok(()) => Ok(true),
            Err(LockError::Held(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquire the lock only if nobody holds it.
    pub fn try_acquire_exclusive(&self) -> LockResult<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                // Holder stamp for operators; the lock itself is the file's presence.
                writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Held(self.kind)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Release the lock. Returns `true` if a lock file was removed.
    pub fn release(&self) -> LockResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Acquire exclusively and return a guard that releases on drop.
    pub fn guard(&self) -> LockResult<LockGuard> {
        self.try_acquire_exclusive()?;
        Ok(LockGuard {
            lock: self.clone(),
            armed: true,
        })
    }
}

/// Releases its lock when dropped unless disarmed.
///
/// Used on paths where the lock must outlive the current call only on
/// success (for example, the `eval` lock after a successful dispatch).
#[derive(Debug)]
pub struct LockGuard {
    lock: Lock,
    armed: bool,
}

impl LockGuard {
    /// Keep the lock held after the guard goes away.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.lock.release() {
                tracing::warn!(lock = %self.lock.kind, error = %e, "Failed to release lock on drop");
            }
        }
    }
}
