//! Adapter error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Adapter disabled: {0}")]
    AdapterDisabled(String),

    #[error("Instance limit reached: {0}")]
    InstanceLimitReached(usize),

    #[error("WebSocket error: {0}")]
    Ws(#[from] marketflow_ws::WsError),
}

pub type AdapterResult<T> = Result<T, AdapterError>;
