//! Error types for marketflow-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Invalid kline interval: {0}")]
    InvalidInterval(String),

    #[error("Validation failed on {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
