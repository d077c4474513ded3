//! Exchange frame parsing and normalization.
//!
//! Converts raw combined-stream frames into canonical `MarketData` records:
//! envelope extraction, event classification, decimal conversion, symbol
//! normalization, invariant validation and quality scoring.

pub mod error;
pub mod parser;
pub mod symbol;

pub use error::{FeedError, FeedResult};
pub use parser::{MessageParser, NormalizedFrame, ParserStats};
pub use symbol::split_symbol;
