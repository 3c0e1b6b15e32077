//! Error types for the broker protocol.

/// Errors raised while decoding or interpreting broker messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown update outcome: {0}")]
    UnknownOutcome(String),

    #[error("invalid queue name: {0}")]
    InvalidQueue(String),

    #[error("unsupported schema version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
