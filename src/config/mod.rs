//! Relay configuration
//!
//! A single TOML file describes the submission root, this process's host
//! name, the host inventory and the evaluator definitions:
//!
//! ```toml
//! submission_root = "/data/submissions"
//! local_host = "web-1"
//!
//! [worker]
//! pool_size = 4
//!
//! [[host]]
//! name = "gpu-node-1"
//! address = "10.0.0.5"
//! submission_root = "/scratch/submissions"
//! script_root = "/opt/evaluators"
//!
//! [[evaluator]]
//! id = "bleu"
//! host = "gpu-node-1"
//! executor = "python"
//! script = "bleu/score.py"
//! ```
//!
//! The config is loaded once and handed to each component's constructor.

mod defaults;
mod inventory;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::EvaluatorRecord;

pub use defaults::{BrokerConfig, LogConfig, SshConfig, WorkerConfig};
pub use inventory::{EvaluatorEntry, HostEntry};

/// Errors that can occur when loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Duplicate host name: '{0}'")]
    DuplicateHost(String),

    #[error("Duplicate evaluator id: '{0}'")]
    DuplicateEvaluator(String),

    #[error("Evaluator '{evaluator}' references unknown host '{host}'")]
    UnknownHost { evaluator: String, host: String },

    #[error("'{name}': missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("'{name}': invalid value for '{field}': {reason}")]
    InvalidValue {
        name: String,
        field: String,
        reason: String,
    },
}

fn default_local_host() -> String {
    "local".to_string()
}

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Root of the local submission directories
    pub submission_root: PathBuf,

    /// Name of the host this process runs on
    #[serde(default = "default_local_host")]
    pub local_host: String,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default, rename = "host")]
    pub hosts: Vec<HostEntry>,

    #[serde(default, rename = "evaluator")]
    pub evaluators: Vec<EvaluatorEntry>,
}

impl RelayConfig {
    /// Config with only a submission root; everything else defaulted.
    pub fn new(submission_root: impl Into<PathBuf>) -> Self {
        Self {
            submission_root: submission_root.into(),
            local_host: default_local_host(),
            log: LogConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            ssh: SshConfig::default(),
            hosts: Vec::new(),
            evaluators: Vec::new(),
        }
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate config from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references between tables
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.submission_root.is_absolute() {
            return Err(ConfigError::InvalidValue {
                name: "relay".to_string(),
                field: "submission_root".to_string(),
                reason: "must be an absolute path".to_string(),
            });
        }
        if self.worker.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "worker".to_string(),
                field: "pool_size".to_string(),
                reason: "pool size must be at least 1".to_string(),
            });
        }
        if self.ssh.port == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ssh".to_string(),
                field: "port".to_string(),
                reason: "port cannot be 0".to_string(),
            });
        }

        let mut hosts = HashSet::new();
        for host in &self.hosts {
            if !hosts.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
            host.validate(self.is_local(&host.name))?;
        }

        let mut evaluators = HashSet::new();
        for evaluator in &self.evaluators {
            if !evaluators.insert(evaluator.id.as_str()) {
                return Err(ConfigError::DuplicateEvaluator(evaluator.id.clone()));
            }
            evaluator.validate()?;
            if !hosts.contains(evaluator.host.as_str()) {
                return Err(ConfigError::UnknownHost {
                    evaluator: evaluator.id.clone(),
                    host: evaluator.host.clone(),
                });
            }
        }
        Ok(())
    }

    /// Get a host by name
    pub fn host(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Whether `name` is the host this process runs on (no sync needed).
    pub fn is_local(&self, name: &str) -> bool {
        name == self.local_host
    }

    /// Evaluator records for seeding a store.
    pub fn evaluator_records(&self) -> Result<Vec<EvaluatorRecord>, ConfigError> {
        self.evaluators.iter().map(EvaluatorEntry::to_record).collect()
    }

    /// Resolved broker spool directory.
    pub fn spool_root(&self) -> PathBuf {
        self.broker
            .spool_root
            .clone()
            .unwrap_or_else(|| self.submission_root.join(".broker"))
    }

    /// Directory holding the JSON submission records.
    pub fn store_root(&self) -> PathBuf {
        self.submission_root.join(".records")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.broker.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.worker.shutdown_grace_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.worker.kill_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASIC: &str = r#"
        submission_root = "/data/submissions"
        local_host = "web-1"

        [ssh]
        user = "bench"
        key_path = "~/.ssh/relay"

        [[host]]
        name = "web-1"
        submission_root = "/data/submissions"
        script_root = "/opt/evaluators"

        [[host]]
        name = "gpu-node-1"
        address = "10.0.0.5"
        submission_root = "/scratch/submissions"
        script_root = "/opt/evaluators"

        [[evaluator]]
        id = "bleu"
        host = "gpu-node-1"
        executor = "python"
        script = "bleu/score.py"
        args = ["--split", "test"]

        [[evaluator]]
        id = "container"
        host = "web-1"
        executor = "docker"
        image = "bench/eval:2"
        script = "run.sh"
    "#;

    #[test]
    fn test_parse_basic_config() {
        let config = RelayConfig::parse(BASIC).unwrap();
        assert_eq!(config.local_host, "web-1");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.ssh.user, "bench");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.worker.pool_size, 4);
        assert!(config.is_local("web-1"));
        assert!(!config.is_local("gpu-node-1"));
        assert_eq!(config.spool_root(), PathBuf::from("/data/submissions/.broker"));

        let records = config.evaluator_records().unwrap();
        assert_eq!(records[0].args, vec!["--split", "test"]);
        assert_eq!(
            records[1].executor,
            relay_protocol::ExecutorKind::Docker {
                image: "bench/eval:2".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let content = r#"
            submission_root = "/data"
            [[host]]
            name = "a"
            address = "a.local"
            submission_root = "/data"
            script_root = "/opt"
            [[host]]
            name = "a"
            address = "b.local"
            submission_root = "/data"
            script_root = "/opt"
        "#;
        assert!(matches!(
            RelayConfig::parse(content),
            Err(ConfigError::DuplicateHost(name)) if name == "a"
        ));
    }

    #[test]
    fn test_evaluator_unknown_host_rejected() {
        let content = r#"
            submission_root = "/data"
            [[evaluator]]
            id = "bleu"
            host = "nowhere"
            executor = "bash"
            script = "x.sh"
        "#;
        assert!(matches!(
            RelayConfig::parse(content),
            Err(ConfigError::UnknownHost { .. })
        ));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let content = r#"
            submission_root = "/data"
            [worker]
            pool_size = 0
        "#;
        assert!(matches!(
            RelayConfig::parse(content),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "pool_size"
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            RelayConfig::load(&dir.path().join("relay.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, BASIC).unwrap();
        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.evaluators.len(), 2);
    }
}
