//! Broker envelope.
//!
//! Every message on the broker is a single JSON object carrying the schema
//! stamp, a unique message id (for duplicate detection in logs) and a
//! tagged body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::event::UpdateEvent;
use crate::job::EvaluationJob;
use crate::{SCHEMA_ID, SCHEMA_VERSION};

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Job(EvaluationJob),
    /// Stop the running evaluation of a submission
    Cancel { submission_id: String },
    Update(UpdateEvent),
    /// A worker shutdown stopped an evaluation; the status is left as is
    Interrupted { submission_id: String, host: String },
    Echo { payload: String },
}

/// Envelope wrapping a message on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub schema_id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub body: Message,
}

impl Envelope {
    /// Wrap a message with a fresh id and timestamp.
    pub fn new(body: Message) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            body,
        }
    }

    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and check the schema version.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(json)?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchema {
                found: envelope.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(envelope)
    }
}
