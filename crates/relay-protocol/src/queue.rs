//! Broker queue names.
//!
//! Evaluation jobs are routed to one queue per execution host
//! (`eval.<host>`) so each worker only sees jobs whose input files were
//! synced to it. Updates and echo probes share a single queue each.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A durable broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Evaluation jobs for one host
    Eval(String),
    /// Completion / failure / cancellation reports
    Update,
    /// Liveness probes
    Echo,
}

impl Queue {
    /// Evaluation queue for a host.
    pub fn eval(host: impl Into<String>) -> Self {
        Queue::Eval(host.into())
    }

    /// Queue name as used on the broker.
    pub fn name(&self) -> String {
        match self {
            Queue::Eval(host) => format!("eval.{}", host),
            Queue::Update => "update".to_string(),
            Queue::Echo => "echo".to_string(),
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Queue {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(Queue::Update),
            "echo" => Ok(Queue::Echo),
            _ => match s.strip_prefix("eval.") {
                Some(host)
                    if !host.is_empty()
                        && !host.starts_with('.')
                        && host
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) =>
                {
                    Ok(Queue::Eval(host.to_string()))
                }
                _ => Err(ProtocolError::InvalidQueue(s.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(Queue::eval("gpu-node-1").name(), "eval.gpu-node-1");
        assert_eq!(Queue::Update.name(), "update");
        assert_eq!(Queue::Echo.name(), "echo");
    }

    #[test]
    fn test_queue_parse() {
        assert_eq!("update".parse::<Queue>().unwrap(), Queue::Update);
        assert_eq!("eval.local".parse::<Queue>().unwrap(), Queue::eval("local"));
        assert!("eval.".parse::<Queue>().is_err());
        assert!("eval.../x".parse::<Queue>().is_err());
        assert!("eval...".parse::<Queue>().is_err());
        assert!("jobs".parse::<Queue>().is_err());
    }
}
