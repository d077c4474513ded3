//! The canonical `MarketData` record and its payload variants.
//!
//! Every message that survives parsing is carried through the pipeline as a
//! `MarketData`. Payloads are tagged variants keyed by the record's
//! `DataType`; a loose field map never crosses a component boundary.

use crate::error::{CoreError, CoreResult};
use crate::{is_valid_symbol, DataType, KlineInterval};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum age of an event relative to its reception, in milliseconds.
/// Records older than this are rejected by validation.
pub const MAX_EVENT_LAG_MS: i64 = 5_000;

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePayload {
    /// Exchange-assigned trade id.
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: TradeSide,
    /// Trade time reported by the exchange (ms since epoch).
    pub timestamp: i64,
}

/// 24-hour rolling ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerPayload {
    pub last: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_pct: Option<Decimal>,
}

/// One candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlinePayload {
    pub open_time: i64,
    pub close_time: i64,
    pub interval: KlineInterval,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Whether this kline is final (the interval has closed).
    pub closed: bool,
}

/// A `(price, quantity)` book level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Incremental depth update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthPayload {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Full order book snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookPayload {
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Tagged payload, keyed by the record's `DataType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Trade(TradePayload),
    Kline(KlinePayload),
    Depth(DepthPayload),
    OrderBook(OrderBookPayload),
    Ticker(TickerPayload),
}

impl Payload {
    /// Whether this payload variant matches the given data type.
    pub fn matches(&self, data_type: DataType) -> bool {
        match (self, data_type) {
            (Self::Trade(_), DataType::Trade) => true,
            (Self::Ticker(_), DataType::Ticker) => true,
            (Self::Depth(_), DataType::Depth) => true,
            (Self::OrderBook(_), DataType::OrderBook) => true,
            (Self::Kline(k), DataType::Kline(interval)) => k.interval == interval,
            _ => false,
        }
    }
}

/// Per-record metadata tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Originating component (e.g. the adapter name).
    pub source: String,
    /// Quality score in [0, 1] assigned by the normalizer.
    pub quality: f64,
    /// Exchange sequence number, when the payload carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Short tags added by processors along the pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            quality: 1.0,
            sequence: None,
            tags: BTreeMap::new(),
        }
    }

    /// Add or replace a processor tag.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }
}

/// The canonical normalized market data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    /// Lowercase exchange id (e.g. `binance`).
    pub exchange: String,
    /// Uppercase slash-separated symbol (e.g. `BTC/USDT`).
    pub symbol: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Event time reported by the exchange (ms since epoch).
    pub event_timestamp: i64,
    /// Reception time stamped by the normalizer (ms since epoch).
    pub received_timestamp: i64,
    pub payload: Payload,
    pub metadata: Metadata,
}

impl MarketData {
    /// The `(exchange, symbol, type)` tuple used for routing, caching and
    /// per-tuple FIFO ordering.
    pub fn tuple_key(&self) -> (String, String, String) {
        (
            self.exchange.clone(),
            self.symbol.clone(),
            self.data_type.as_str(),
        )
    }

    /// Event-to-reception lag in milliseconds. Negative when the exchange
    /// clock runs ahead of ours.
    pub fn lag_ms(&self) -> i64 {
        self.received_timestamp - self.event_timestamp
    }

    /// Validate the record invariants.
    ///
    /// - `event_timestamp > 0`
    /// - `received_timestamp >= event_timestamp - 5000`
    /// - symbol matches `BASE/QUOTE`
    /// - payload variant matches `type`
    pub fn validate(&self) -> CoreResult<()> {
        if self.event_timestamp <= 0 {
            return Err(CoreError::Validation {
                field: "event_timestamp",
                reason: format!("must be positive, got {}", self.event_timestamp),
            });
        }
        if self.received_timestamp < self.event_timestamp - MAX_EVENT_LAG_MS {
            return Err(CoreError::Validation {
                field: "received_timestamp",
                reason: format!(
                    "received {} predates event {} by more than {}ms",
                    self.received_timestamp, self.event_timestamp, MAX_EVENT_LAG_MS
                ),
            });
        }
        if !is_valid_symbol(&self.symbol) {
            return Err(CoreError::Validation {
                field: "symbol",
                reason: format!("not BASE/QUOTE shaped: {}", self.symbol),
            });
        }
        if !self.payload.matches(self.data_type) {
            return Err(CoreError::Validation {
                field: "payload",
                reason: format!("payload variant does not match type {}", self.data_type),
            });
        }
        Ok(())
    }
}
