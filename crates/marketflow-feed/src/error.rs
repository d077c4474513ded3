//! Feed error types.
//!
//! All of these are local: the offending frame is dropped and a counter
//! incremented. Parsing never affects connection state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not a combined-stream envelope: {0}")]
    Envelope(String),

    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    #[error("Validation failed on {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FeedResult<T> = Result<T, FeedError>;
