//! Transformers: pure per-record functions applied before routing.
//!
//! A transformer may rewrite the record or drop it by returning `None`.
//! Side effects beyond metadata tagging are not allowed; a drop is counted
//! by the engine against the transformer's id.

use marketflow_core::MarketData;

/// A pure record transformer.
pub trait Transformer: Send + Sync {
    fn id(&self) -> &str;

    /// Transform or drop a record. `None` means drop.
    fn transform(&self, data: MarketData) -> Option<MarketData>;
}

/// Adds a fixed metadata tag to every record.
pub struct TagTransformer {
    id: String,
    key: String,
    value: String,
}

impl TagTransformer {
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Transformer for TagTransformer {
    fn id(&self) -> &str {
        &self.id
    }

    fn transform(&self, mut data: MarketData) -> Option<MarketData> {
        data.metadata.tag(self.key.clone(), self.value.clone());
        Some(data)
    }
}

/// Drops records whose quality score is below a threshold.
pub struct MinQualityFilter {
    id: String,
    min_quality: f64,
}

impl MinQualityFilter {
    pub fn new(id: impl Into<String>, min_quality: f64) -> Self {
        Self {
            id: id.into(),
            min_quality,
        }
    }
}

impl Transformer for MinQualityFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn transform(&self, data: MarketData) -> Option<MarketData> {
        if data.metadata.quality < self.min_quality {
            None
        } else {
            Some(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, Metadata, Payload, TradePayload, TradeSide};
    use rust_decimal_macros::dec;

    fn record(quality: f64) -> MarketData {
        let mut metadata = Metadata::new("binance");
        metadata.quality = quality;
        MarketData {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            data_type: DataType::Trade,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Trade(TradePayload {
                id: "1".to_string(),
                price: dec!(1),
                quantity: dec!(1),
                side: TradeSide::Buy,
                timestamp: 1,
            }),
            metadata,
        }
    }

    #[test]
    fn test_tag_transformer() {
        let t = TagTransformer::new("tagger", "pipeline", "test");
        let out = t.transform(record(1.0)).unwrap();
        assert_eq!(out.metadata.tags.get("pipeline").unwrap(), "test");
    }

    #[test]
    fn test_quality_filter() {
        let t = MinQualityFilter::new("quality", 0.5);
        assert!(t.transform(record(0.7)).is_some());
        assert!(t.transform(record(0.3)).is_none());
    }
}
