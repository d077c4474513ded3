//! DataFlow error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("Transient sink error: {0}")]
    SinkTransient(String),

    #[error("Permanent sink error: {0}")]
    SinkPermanent(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl FlowError {
    /// Whether a sink write failure should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkTransient(_) | Self::Timeout(_))
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
