//! Evaluation job messages.
//!
//! An `EvaluationJob` tells a worker which script to run against which
//! submission and how. The executor is a closed set of variants, each with
//! its own command builder, so an unknown executor cannot be constructed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default interpreter for interpreted-script evaluators.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Mount point of the submission directory inside evaluator containers.
pub const CONTAINER_MOUNT: &str = "/submission";

/// Mechanism used to run an evaluator script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Interpreted script (`python3 script.py ...`)
    Python {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<String>,
    },
    /// Shell script run through bash
    Bash,
    /// Batch-scheduler job submitted with `sbatch --wait`
    Sbatch,
    /// Containerized job run through `docker run`
    Docker { image: String },
}

impl ExecutorKind {
    /// Short stable name used in logs and job labels.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutorKind::Python { .. } => "python",
            ExecutorKind::Bash => "bash",
            ExecutorKind::Sbatch => "sbatch",
            ExecutorKind::Docker { .. } => "docker",
        }
    }

    /// Whether the evaluator output goes to `slurm.log` instead of `evaluation.log`.
    pub fn is_batch(&self) -> bool {
        matches!(self, ExecutorKind::Sbatch)
    }

    /// Build the process invocation for a job.
    ///
    /// `submission_dir` is the submission directory on the executing host.
    /// `script_root` is the evaluator script root there; containers mount it
    /// read-only at the same path so `script` resolves inside them.
    pub fn command(&self, script: &str, args: &[String], submission_dir: &str, script_root: &str) -> CommandSpec {
        match self {
            ExecutorKind::Python { interpreter } => {
                let program = interpreter
                    .clone()
                    .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());
                CommandSpec::new(program, script, args)
            }
            ExecutorKind::Bash => CommandSpec::new("bash", script, args),
            ExecutorKind::Sbatch => {
                let mut spec = CommandSpec {
                    program: "sbatch".to_string(),
                    args: vec![
                        "--wait".to_string(),
                        "--parsable".to_string(),
                        "--chdir".to_string(),
                        submission_dir.to_string(),
                        "--output".to_string(),
                        format!("{}/slurm.log", submission_dir.trim_end_matches('/')),
                    ],
                };
                spec.args.push(script.to_string());
                spec.args.extend(args.iter().cloned());
                spec
            }
            ExecutorKind::Docker { image } => {
                let mut spec = CommandSpec {
                    program: "docker".to_string(),
                    args: vec![
                        "run".to_string(),
                        "--rm".to_string(),
                        "-v".to_string(),
                        format!("{}:{}", submission_dir, CONTAINER_MOUNT),
                    ],
                };
                let scripts = if script_root.is_empty() {
                    script.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
                } else {
                    script_root.trim_end_matches('/')
                };
                if !scripts.is_empty() {
                    spec.args.push("-v".to_string());
                    spec.args.push(format!("{}:{}:ro", scripts, scripts));
                }
                spec.args.push("-w".to_string());
                spec.args.push(CONTAINER_MOUNT.to_string());
                spec.args.push(image.clone());
                spec.args.push(script.to_string());
                spec.args.extend(args.iter().cloned());
                spec
            }
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: impl Into<String>, script: &str, args: &[String]) -> Self {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(script.to_string());
        all.extend(args.iter().cloned());
        Self {
            program: program.into(),
            args: all,
        }
    }
}

/// Job published to an evaluation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationJob {
    /// Human-readable label (`<evaluator>:<submission>`)
    pub label: String,
    /// Target submission id
    pub submission_id: String,
    /// Evaluator id the job was built from
    pub evaluator_id: String,
    /// How to run the script
    pub executor: ExecutorKind,
    /// Absolute, allow-listed script path on the executing host
    pub script: String,
    /// Script root the script was resolved against
    #[serde(default)]
    pub script_root: String,
    /// Evaluator base arguments followed by caller-supplied extras
    #[serde(default)]
    pub args: Vec<String>,
    /// Name of the executing host
    pub host: String,
    /// Submission directory on the executing host
    pub submission_dir: String,
}

impl EvaluationJob {
    /// Build the process invocation for this job.
    pub fn command(&self) -> CommandSpec {
        self.executor
            .command(&self.script, &self.args, &self.submission_dir, &self.script_root)
    }
}
