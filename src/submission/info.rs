//! Static submission metadata (`info.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Metadata written once when the submission directory is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    pub id: String,
    pub user_id: String,
    pub benchmark_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub auto_eval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_id: Option<String>,
}

impl SubmissionInfo {
    /// Create metadata for a new submission stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        benchmark_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            benchmark_id: benchmark_id.into(),
            model_id: model_id.into(),
            created_at: Utc::now(),
            auto_eval: false,
            author: None,
            evaluator_id: None,
        }
    }

    pub fn with_auto_eval(mut self, auto_eval: bool) -> Self {
        self.auto_eval = auto_eval;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_evaluator(mut self, evaluator_id: impl Into<String>) -> Self {
        self.evaluator_id = Some(evaluator_id.into());
        self
    }

    /// Write to `path`, refusing to overwrite an existing file.
    pub(crate) fn write_once(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()
    }

    pub(crate) fn read(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
