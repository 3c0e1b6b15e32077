//! Relational-store collaborator
//!
//! The relay never owns the submission table; it reads records and
//! applies status transitions through this trait. `MemoryStore` backs
//! tests and single-process setups, `JsonStore` keeps one JSON record per
//! submission on disk for the operator binary.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use relay_protocol::ExecutorKind;
use serde::{Deserialize, Serialize};

use super::status::{Submission, SubmissionStatus, TransitionError};

/// Errors from the relational store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("submission not found: {0}")]
    NotFound(String),

    #[error("evaluator not found: {0}")]
    EvaluatorNotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the failure is infrastructure rather than a domain error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Evaluator configuration as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorRecord {
    pub id: String,
    /// Execution host name from the host inventory
    pub host: String,
    pub executor: ExecutorKind,
    /// Script path relative to the host's script root
    pub script: String,
    /// Base arguments placed before caller-supplied extras
    #[serde(default)]
    pub args: Vec<String>,
}

/// Relational-store operations used by the core.
pub trait SubmissionStore: Send + Sync {
    /// Load a submission record.
    fn get_submission(&self, id: &str) -> Result<Submission, StoreError>;

    /// Insert or replace a submission record.
    fn put_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    /// Apply a status transition atomically and return the updated record.
    fn update_status(&self, id: &str, status: SubmissionStatus) -> Result<Submission, StoreError>;

    /// Load an evaluator definition.
    fn get_evaluator(&self, id: &str) -> Result<EvaluatorRecord, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: Mutex<HashMap<String, Submission>>,
    evaluators: Mutex<HashMap<String, EvaluatorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator definition.
    pub fn add_evaluator(&self, evaluator: EvaluatorRecord) {
        if let Ok(mut evaluators) = self.evaluators.lock() {
            evaluators.insert(evaluator.id.clone(), evaluator);
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("store mutex poisoned".to_string())
    }
}

impl SubmissionStore for MemoryStore {
    fn get_submission(&self, id: &str) -> Result<Submission, StoreError> {
        let submissions = self.submissions.lock().map_err(|_| Self::poisoned())?;
        submissions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut submissions = self.submissions.lock().map_err(|_| Self::poisoned())?;
        submissions.insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    fn update_status(&self, id: &str, status: SubmissionStatus) -> Result<Submission, StoreError> {
        let mut submissions = self.submissions.lock().map_err(|_| Self::poisoned())?;
        let submission = submissions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        submission.transition(status)?;
        Ok(submission.clone())
    }

    fn get_evaluator(&self, id: &str) -> Result<EvaluatorRecord, StoreError> {
        let evaluators = self.evaluators.lock().map_err(|_| Self::poisoned())?;
        evaluators
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::EvaluatorNotFound(id.to_string()))
    }
}

/// File-backed store: `<root>/<id>.json` per submission.
///
/// Writes go through write-then-rename. Evaluators come from configuration.
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    evaluators: HashMap<String, EvaluatorRecord>,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, evaluators: Vec<EvaluatorRecord>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            evaluators: evaluators.into_iter().map(|e| (e.id.clone(), e)).collect(),
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn read(&self, id: &str) -> Result<Submission, StoreError> {
        let path = self.record_path(id);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn write(&self, submission: &Submission) -> Result<(), StoreError> {
        let path = self.record_path(&submission.id);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(submission)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// List every stored submission id.
    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl SubmissionStore for JsonStore {
    fn get_submission(&self, id: &str) -> Result<Submission, StoreError> {
        self.read(id)
    }

    fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))?;
        self.write(submission)
    }

    fn update_status(&self, id: &str, status: SubmissionStatus) -> Result<Submission, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))?;
        let mut submission = self.read(id)?;
        submission.transition(status)?;
        self.write(&submission)?;
        Ok(submission)
    }

    fn get_evaluator(&self, id: &str) -> Result<EvaluatorRecord, StoreError> {
        self.evaluators
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::EvaluatorNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn evaluator() -> EvaluatorRecord {
        EvaluatorRecord {
            id: "bleu".to_string(),
            host: "local".to_string(),
            executor: ExecutorKind::Bash,
            script: "bleu/run.sh".to_string(),
            args: vec![],
        }
    }

    #[test]
    fn test_memory_store_update_status() {
        let store = MemoryStore::new();
        store.put_submission(&Submission::new("s1", "u", "b", "m")).unwrap();

        let updated = store.update_status("s1", SubmissionStatus::Uploaded).unwrap();
        assert_eq!(updated.status, SubmissionStatus::Uploaded);
        assert_eq!(store.get_submission("s1").unwrap().status, SubmissionStatus::Uploaded);
    }

    #[test]
    fn test_memory_store_rejects_illegal_transition() {
        let store = MemoryStore::new();
        store.put_submission(&Submission::new("s1", "u", "b", "m")).unwrap();

        let err = store.update_status("s1", SubmissionStatus::Completed).unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.get_submission("s1").unwrap().status, SubmissionStatus::Uploading);
    }

    #[test]
    fn test_memory_store_missing() {
        let store = MemoryStore::new();
        assert!(matches!(store.get_submission("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.get_evaluator("nope"), Err(StoreError::EvaluatorNotFound(_))));
        store.add_evaluator(evaluator());
        assert_eq!(store.get_evaluator("bleu").unwrap().host, "local");
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonStore::open(dir.path(), vec![evaluator()]).unwrap();
            store.put_submission(&Submission::new("s1", "u", "b", "m")).unwrap();
            store.update_status("s1", SubmissionStatus::Uploaded).unwrap();
        }

        let store = JsonStore::open(dir.path(), vec![]).unwrap();
        assert_eq!(store.get_submission("s1").unwrap().status, SubmissionStatus::Uploaded);
        assert_eq!(store.ids().unwrap(), vec!["s1".to_string()]);
        assert!(store.get_evaluator("bleu").is_err());
    }
}
