//! Canonical market data types for the marketflow collector.
//!
//! This crate provides the types shared by every stage of the pipeline:
//! - `MarketData`: the normalized record produced by the feed parser
//! - `Payload`: tagged payload variants (trade, ticker, kline, depth, book)
//! - `DataType`, `KlineInterval`: message classification
//! - `Metadata`: per-record tags (source, quality, sequence)

pub mod data;
pub mod error;
pub mod interval;

pub use data::{
    BookLevel, DepthPayload, KlinePayload, MarketData, Metadata, OrderBookPayload, Payload,
    TickerPayload, TradePayload, TradeSide,
};
pub use error::{CoreError, CoreResult};
pub use interval::KlineInterval;

use serde::{Deserialize, Serialize};

/// Classification of a normalized market data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Trade,
    Ticker,
    Depth,
    Kline(KlineInterval),
    OrderBook,
}

impl DataType {
    /// Wire name of this data type (e.g. `kline_1m`, `order_book`).
    pub fn as_str(&self) -> String {
        match self {
            Self::Trade => "trade".to_string(),
            Self::Ticker => "ticker".to_string(),
            Self::Depth => "depth".to_string(),
            Self::Kline(interval) => format!("kline_{interval}"),
            Self::OrderBook => "order_book".to_string(),
        }
    }

    /// Parse a wire name back into a data type.
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "trade" => Ok(Self::Trade),
            "ticker" => Ok(Self::Ticker),
            "depth" => Ok(Self::Depth),
            "order_book" => Ok(Self::OrderBook),
            other => {
                if let Some(interval) = other.strip_prefix("kline_") {
                    Ok(Self::Kline(interval.parse()?))
                } else {
                    Err(CoreError::InvalidDataType(other.to_string()))
                }
            }
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Check a normalized symbol against the `BASE/QUOTE` shape
/// (`^[A-Z0-9]+/[A-Z0-9]+$`).
pub fn is_valid_symbol(symbol: &str) -> bool {
    let Some((base, quote)) = symbol.split_once('/') else {
        return false;
    };
    let part_ok = |p: &str| {
        !p.is_empty()
            && p.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };
    part_ok(base) && part_ok(quote)
}
