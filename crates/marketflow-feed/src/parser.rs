//! Frame parsing into canonical `MarketData` records.
//!
//! The parser is a pure per-frame function: combined envelopes in,
//! validated records out. Classification is driven by the stream name and
//! cross-checked against the payload's event tag. Numeric strings become
//! `Decimal`s, symbols become `BASE/QUOTE`, and every record is scored for
//! quality before it leaves.

use crate::error::{FeedError, FeedResult};
use crate::symbol::split_symbol;
use chrono::Utc;
use marketflow_core::{
    BookLevel, DataType, DepthPayload, KlinePayload, MarketData, Metadata, OrderBookPayload,
    Payload, TickerPayload, TradePayload, TradeSide,
};
use marketflow_ws::{parse_stream_name, StreamKind};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Quality deduction per missing required field.
const MISSING_FIELD_PENALTY: f64 = 0.3;
/// Quality deduction for reception lag beyond 5 seconds.
const STALE_PENALTY: f64 = 0.2;
/// Quality deduction for reception lag between 1 and 5 seconds.
const SLOW_PENALTY: f64 = 0.1;

/// A successfully normalized frame: the canonical record plus the stream
/// it arrived on (used by the caller for per-subscription accounting).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFrame {
    pub stream: String,
    pub data: MarketData,
}

/// Parsing outcome counters (shared across the adapter's lifetime).
#[derive(Debug, Default)]
pub struct ParserStats {
    pub accepted: AtomicU64,
    pub parse_errors: AtomicU64,
    pub unknown_events: AtomicU64,
    pub validation_errors: AtomicU64,
}

impl ParserStats {
    pub fn record(&self, result: &FeedResult<NormalizedFrame>) {
        match result {
            Ok(_) => self.accepted.fetch_add(1, Ordering::Relaxed),
            Err(FeedError::UnknownEvent(_)) => self.unknown_events.fetch_add(1, Ordering::Relaxed),
            Err(FeedError::Validation { .. }) => {
                self.validation_errors.fetch_add(1, Ordering::Relaxed)
            }
            Err(_) => self.parse_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn unknown_events(&self) -> u64 {
        self.unknown_events.load(Ordering::Relaxed)
    }

    pub fn validation_errors(&self) -> u64 {
        self.validation_errors.load(Ordering::Relaxed)
    }
}

/// Combined-stream envelope. Anything not shaped like this is rejected.
#[derive(Debug, Deserialize)]
struct CombinedEnvelope {
    stream: String,
    data: serde_json::Value,
}

/// Raw Binance trade event.
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(default)]
    s: Option<String>,
    /// Trade id; missing ids lower the quality score.
    #[serde(default)]
    t: Option<u64>,
    p: String,
    q: String,
    /// Trade time; falls back to the event time when absent.
    #[serde(rename = "T", default)]
    trade_time: Option<i64>,
    /// True when the buyer is the market maker (taker sold).
    m: bool,
}

/// Raw Binance 24h ticker event.
#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(default)]
    s: Option<String>,
    /// Last price.
    c: String,
    o: String,
    h: String,
    l: String,
    v: String,
    /// Quote asset volume.
    q: String,
    #[serde(default)]
    b: Option<String>,
    #[serde(default)]
    a: Option<String>,
    /// Price change percent.
    #[serde(rename = "P", default)]
    price_change_pct: Option<String>,
}

/// Raw Binance kline event.
#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(default)]
    s: Option<String>,
    k: RawKlineData,
}

#[derive(Debug, Deserialize)]
struct RawKlineData {
    t: i64,
    #[serde(rename = "T")]
    close_time: i64,
    i: String,
    o: String,
    c: String,
    h: String,
    l: String,
    v: String,
    /// Whether this kline is final.
    x: bool,
}

/// Raw Binance incremental depth update.
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(default)]
    s: Option<String>,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    b: Vec<(String, String)>,
    a: Vec<(String, String)>,
}

/// Raw Binance partial book snapshot (no event tag on the wire).
#[derive(Debug, Deserialize)]
struct RawPartialBook {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Frame parser for one exchange.
pub struct MessageParser {
    exchange: String,
    stats: ParserStats,
}

impl MessageParser {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    /// Parse a raw frame, stamping reception with the current time.
    pub fn parse(&self, raw: &str) -> FeedResult<NormalizedFrame> {
        let result = self.parse_at(raw, Utc::now().timestamp_millis());
        self.stats.record(&result);
        result
    }

    /// Parse a raw frame with an explicit reception timestamp.
    ///
    /// Pure: no counters are touched, which keeps property tests exact.
    pub fn parse_at(&self, raw: &str, received_ms: i64) -> FeedResult<NormalizedFrame> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| FeedError::Parse(format!("malformed JSON: {e}")))?;

        let envelope: CombinedEnvelope = serde_json::from_value(value).map_err(|_| {
            FeedError::Envelope("frame is not a combined-stream envelope".to_string())
        })?;

        let (raw_symbol, kind) = parse_stream_name(&envelope.stream)
            .map_err(|_| FeedError::UnknownEvent(envelope.stream.clone()))?;

        self.check_event_tag(&envelope.stream, &kind, &envelope.data)?;

        let mut missing = 0u32;
        let (data_type, event_timestamp, wire_symbol, sequence, payload) = match kind {
            StreamKind::Trade => {
                let raw: RawTrade = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("invalid trade payload: {e}")))?;
                let side = if raw.m { TradeSide::Sell } else { TradeSide::Buy };
                if raw.t.is_none() {
                    missing += 1;
                }
                if raw.trade_time.is_none() {
                    missing += 1;
                }
                let timestamp = raw.trade_time.unwrap_or(raw.event_time);
                let sequence = raw.t;
                let payload = Payload::Trade(TradePayload {
                    id: raw.t.map(|t| t.to_string()).unwrap_or_default(),
                    price: parse_decimal(&raw.p, "p")?,
                    quantity: parse_decimal(&raw.q, "q")?,
                    side,
                    timestamp,
                });
                (DataType::Trade, raw.event_time, raw.s, sequence, payload)
            }
            StreamKind::Ticker => {
                let raw: RawTicker = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("invalid ticker payload: {e}")))?;
                let payload = Payload::Ticker(TickerPayload {
                    last: parse_decimal(&raw.c, "c")?,
                    open: parse_decimal(&raw.o, "o")?,
                    high: parse_decimal(&raw.h, "h")?,
                    low: parse_decimal(&raw.l, "l")?,
                    volume: parse_decimal(&raw.v, "v")?,
                    quote_volume: parse_decimal(&raw.q, "q")?,
                    bid: parse_optional_decimal(raw.b.as_deref(), "b")?,
                    ask: parse_optional_decimal(raw.a.as_deref(), "a")?,
                    price_change_pct: parse_optional_decimal(
                        raw.price_change_pct.as_deref(),
                        "P",
                    )?,
                });
                (DataType::Ticker, raw.event_time, raw.s, None, payload)
            }
            StreamKind::Kline(interval) => {
                let raw: RawKline = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("invalid kline payload: {e}")))?;
                let wire_interval: marketflow_core::KlineInterval =
                    raw.k.i.parse().map_err(|_| {
                        FeedError::Parse(format!("unknown kline interval: {}", raw.k.i))
                    })?;
                if wire_interval != interval {
                    return Err(FeedError::Validation {
                        field: "k.i".to_string(),
                        reason: format!(
                            "interval {wire_interval} does not match stream {interval}"
                        ),
                    });
                }
                let payload = Payload::Kline(KlinePayload {
                    open_time: raw.k.t,
                    close_time: raw.k.close_time,
                    interval,
                    open: parse_decimal(&raw.k.o, "k.o")?,
                    high: parse_decimal(&raw.k.h, "k.h")?,
                    low: parse_decimal(&raw.k.l, "k.l")?,
                    close: parse_decimal(&raw.k.c, "k.c")?,
                    volume: parse_decimal(&raw.k.v, "k.v")?,
                    closed: raw.k.x,
                });
                (
                    DataType::Kline(interval),
                    raw.event_time,
                    raw.s,
                    None,
                    payload,
                )
            }
            StreamKind::Depth { levels, .. } => {
                if levels.is_some() || envelope.data.get("lastUpdateId").is_some() {
                    // Partial book snapshot: no event tag, no timestamp on
                    // the wire; stamped with reception time.
                    let raw: RawPartialBook = serde_json::from_value(envelope.data)
                        .map_err(|e| FeedError::Parse(format!("invalid book payload: {e}")))?;
                    let payload = Payload::OrderBook(OrderBookPayload {
                        last_update_id: raw.last_update_id,
                        bids: parse_levels(&raw.bids)?,
                        asks: parse_levels(&raw.asks)?,
                    });
                    (
                        DataType::OrderBook,
                        received_ms,
                        None,
                        Some(raw.last_update_id),
                        payload,
                    )
                } else {
                    let raw: RawDepthUpdate = serde_json::from_value(envelope.data)
                        .map_err(|e| FeedError::Parse(format!("invalid depth payload: {e}")))?;
                    let sequence = Some(raw.final_update_id);
                    let payload = Payload::Depth(DepthPayload {
                        first_update_id: raw.first_update_id,
                        final_update_id: raw.final_update_id,
                        bids: parse_levels(&raw.b)?,
                        asks: parse_levels(&raw.a)?,
                    });
                    (DataType::Depth, raw.event_time, raw.s, sequence, payload)
                }
            }
        };

        let symbol = split_symbol(wire_symbol.as_deref().unwrap_or(&raw_symbol))?;

        let mut metadata = Metadata::new(self.exchange.clone());
        metadata.sequence = sequence;
        metadata.quality = quality_score(missing, received_ms - event_timestamp);

        let record = MarketData {
            exchange: self.exchange.clone(),
            symbol,
            data_type,
            event_timestamp,
            received_timestamp: received_ms,
            payload,
            metadata,
        };

        record.validate().map_err(|e| match e {
            marketflow_core::CoreError::Validation { field, reason } => {
                warn!(stream = %envelope.stream, field, %reason, "Record failed validation");
                FeedError::Validation {
                    field: field.to_string(),
                    reason,
                }
            }
            other => FeedError::Parse(other.to_string()),
        })?;

        debug!(
            symbol = %record.symbol,
            data_type = %record.data_type,
            quality = record.metadata.quality,
            "Frame normalized"
        );
        Ok(NormalizedFrame {
            stream: envelope.stream,
            data: record,
        })
    }

    /// Cross-check the payload's event tag against the stream-derived kind.
    fn check_event_tag(
        &self,
        stream: &str,
        kind: &StreamKind,
        data: &serde_json::Value,
    ) -> FeedResult<()> {
        let Some(tag) = data.get("e").and_then(|e| e.as_str()) else {
            return Ok(());
        };
        let expected = match kind {
            StreamKind::Trade => "trade",
            StreamKind::Ticker => "24hrTicker",
            StreamKind::Kline(_) => "kline",
            StreamKind::Depth { .. } => "depthUpdate",
        };
        if tag != expected {
            if matches!(tag, "trade" | "24hrTicker" | "kline" | "depthUpdate") {
                return Err(FeedError::Validation {
                    field: "e".to_string(),
                    reason: format!("event {tag} does not match stream {stream}"),
                });
            }
            return Err(FeedError::UnknownEvent(tag.to_string()));
        }
        Ok(())
    }
}

fn parse_decimal(s: &str, field: &str) -> FeedResult<Decimal> {
    s.parse()
        .map_err(|_| FeedError::Parse(format!("invalid decimal in {field}: {s}")))
}

fn parse_optional_decimal(s: Option<&str>, field: &str) -> FeedResult<Option<Decimal>> {
    s.map(|s| parse_decimal(s, field)).transpose()
}

fn parse_levels(raw: &[(String, String)]) -> FeedResult<Vec<BookLevel>> {
    raw.iter()
        .map(|(p, q)| {
            Ok(BookLevel {
                price: parse_decimal(p, "level price")?,
                quantity: parse_decimal(q, "level quantity")?,
            })
        })
        .collect()
}

/// Quality score: 1.0 minus 0.3 per missing required field, 0.2 when the
/// record arrived more than 5s after the event, 0.1 for 1-5s, floored at 0.
fn quality_score(missing_fields: u32, lag_ms: i64) -> f64 {
    let mut score = 1.0 - MISSING_FIELD_PENALTY * missing_fields as f64;
    if lag_ms > 5_000 {
        score -= STALE_PENALTY;
    } else if lag_ms >= 1_000 {
        score -= SLOW_PENALTY;
    }
    score.max(0.0)
}
