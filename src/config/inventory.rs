//! Host and evaluator inventory entries
//!
//! `[[host]]` entries describe execution hosts; `[[evaluator]]` entries
//! name a script on one of those hosts and how to run it.

use std::path::PathBuf;

use relay_protocol::ExecutorKind;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::state::EvaluatorRecord;

/// A single execution host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Unique host name; also the suffix of its `eval.<name>` queue
    pub name: String,

    /// SSH hostname or IP address; unused for the local host
    #[serde(default)]
    pub address: Option<String>,

    /// SSH user override for this host
    #[serde(default)]
    pub user: Option<String>,

    /// Root under which submission directories are mirrored on this host
    pub submission_root: PathBuf,

    /// Allow-listed root every evaluator script on this host must live under
    pub script_root: PathBuf,
}

impl HostEntry {
    pub(super) fn validate(&self, is_local: bool) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidValue {
                name: self.name.clone(),
                field: "name".to_string(),
                reason: "name must contain only alphanumeric characters, dashes, and underscores"
                    .to_string(),
            });
        }

        if !is_local && self.address.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingField {
                name: self.name.clone(),
                field: "address".to_string(),
            });
        }

        for (field, path) in [
            ("submission_root", &self.submission_root),
            ("script_root", &self.script_root),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    name: self.name.clone(),
                    field: field.to_string(),
                    reason: "must be an absolute path".to_string(),
                });
            }
        }
        Ok(())
    }

    /// `user@address` destination for ssh and rsync.
    pub fn destination(&self, default_user: &str) -> String {
        let user = self.user.as_deref().unwrap_or(default_user);
        let address = self.address.as_deref().unwrap_or(&self.name);
        format!("{}@{}", user, address)
    }
}

/// A single evaluator definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorEntry {
    pub id: String,

    /// Host the evaluator runs on
    pub host: String,

    /// `python`, `bash`, `sbatch` or `docker`
    pub executor: String,

    /// Script path, relative to the host's script root
    pub script: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Container image (docker only)
    #[serde(default)]
    pub image: Option<String>,

    /// Interpreter override (python only)
    #[serde(default)]
    pub interpreter: Option<String>,
}

impl EvaluatorEntry {
    fn invalid(&self, field: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            name: self.id.clone(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Resolve the executor name into its typed form.
    pub fn executor_kind(&self) -> Result<ExecutorKind, ConfigError> {
        match self.executor.as_str() {
            "python" => Ok(ExecutorKind::Python {
                interpreter: self.interpreter.clone(),
            }),
            "bash" => Ok(ExecutorKind::Bash),
            "sbatch" => Ok(ExecutorKind::Sbatch),
            "docker" => match &self.image {
                Some(image) if !image.is_empty() => Ok(ExecutorKind::Docker {
                    image: image.clone(),
                }),
                _ => Err(self.invalid("image", "docker evaluators require an image")),
            },
            other => Err(self.invalid("executor", format!("unknown executor '{}'", other))),
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingField {
                name: "(unnamed)".to_string(),
                field: "id".to_string(),
            });
        }
        if self.script.is_empty() {
            return Err(ConfigError::MissingField {
                name: self.id.clone(),
                field: "script".to_string(),
            });
        }
        self.executor_kind().map(|_| ())
    }

    /// Evaluator record as served by the store.
    pub fn to_record(&self) -> Result<EvaluatorRecord, ConfigError> {
        Ok(EvaluatorRecord {
            id: self.id.clone(),
            host: self.host.clone(),
            executor: self.executor_kind()?,
            script: self.script.clone(),
            args: self.args.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(executor: &str) -> EvaluatorEntry {
        EvaluatorEntry {
            id: "bleu".to_string(),
            host: "gpu-node-1".to_string(),
            executor: executor.to_string(),
            script: "bleu/score.py".to_string(),
            args: vec![],
            image: None,
            interpreter: None,
        }
    }

    #[test]
    fn test_executor_kind_resolution() {
        assert_eq!(
            evaluator("python").executor_kind().unwrap(),
            ExecutorKind::Python { interpreter: None }
        );
        assert_eq!(evaluator("sbatch").executor_kind().unwrap(), ExecutorKind::Sbatch);
        assert!(evaluator("perl").executor_kind().is_err());
    }

    #[test]
    fn test_docker_requires_image() {
        let mut entry = evaluator("docker");
        assert!(matches!(
            entry.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "image"
        ));
        entry.image = Some("bench/eval:1".to_string());
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_host_destination() {
        let host = HostEntry {
            name: "gpu-node-1".to_string(),
            address: Some("10.0.0.5".to_string()),
            user: None,
            submission_root: PathBuf::from("/data/subs"),
            script_root: PathBuf::from("/opt/eval"),
        };
        assert_eq!(host.destination("relay"), "relay@10.0.0.5");
        assert!(host.validate(false).is_ok());
    }

    #[test]
    fn test_remote_host_requires_address() {
        let host = HostEntry {
            name: "gpu-node-1".to_string(),
            address: None,
            user: None,
            submission_root: PathBuf::from("/data/subs"),
            script_root: PathBuf::from("/opt/eval"),
        };
        assert!(matches!(host.validate(false), Err(ConfigError::MissingField { .. })));
        assert!(host.validate(true).is_ok());
    }
}
