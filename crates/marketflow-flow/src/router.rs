//! Rule-based routing to sink targets.
//!
//! Rules are evaluated in descending priority; the first matching rule
//! decides the target set unless it is marked `continue_matching`, in which
//! case evaluation keeps going and targets accumulate.

use marketflow_core::MarketData;
use std::collections::{BTreeMap, HashSet};

/// Predicate over `(exchange, symbol, type, metadata)`.
/// An empty field is a wildcard.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    pub exchanges: HashSet<String>,
    pub symbols: HashSet<String>,
    /// Type names as produced by `DataType::as_str`. The entry `kline`
    /// matches every kline interval.
    pub types: HashSet<String>,
    /// Metadata tags that must all be present with equal values.
    pub metadata_tags: BTreeMap<String, String>,
}

impl RouteMatcher {
    /// Matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, data: &MarketData) -> bool {
        if !self.exchanges.is_empty() && !self.exchanges.contains(&data.exchange) {
            return false;
        }
        if !self.symbols.is_empty() && !self.symbols.contains(&data.symbol) {
            return false;
        }
        if !self.types.is_empty() {
            let type_name = data.data_type.as_str();
            let kline_bucket = type_name.starts_with("kline_") && self.types.contains("kline");
            if !kline_bucket && !self.types.contains(&type_name) {
                return false;
            }
        }
        self.metadata_tags
            .iter()
            .all(|(k, v)| data.metadata.tags.get(k) == Some(v))
    }
}

/// A routing rule: matcher, targets and optional per-rule transformers.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub id: String,
    pub priority: i32,
    pub matcher: RouteMatcher,
    /// Sink ids this rule routes to.
    pub targets: Vec<String>,
    /// Transformer ids applied to the record for this rule's targets.
    pub transformer_ids: Vec<String>,
    /// Keep evaluating lower-priority rules after this one matches.
    pub continue_matching: bool,
}

impl RouteRule {
    pub fn new(id: impl Into<String>, priority: i32, matcher: RouteMatcher, targets: Vec<String>) -> Self {
        Self {
            id: id.into(),
            priority,
            matcher,
            targets,
            transformer_ids: Vec::new(),
            continue_matching: false,
        }
    }
}

/// The result of routing one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDecision {
    /// Deduplicated targets, in rule-priority order.
    pub targets: Vec<String>,
    pub transformer_ids: Vec<String>,
}

impl RouteDecision {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Ordered rule evaluator.
#[derive(Debug, Default)]
pub struct Router {
    /// Rules in descending priority order.
    rules: Vec<RouteRule>,
}

impl Router {
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Evaluate rules by descending priority. The first match wins unless
    /// marked `continue_matching`; continuing rules accumulate targets.
    pub fn route(&self, data: &MarketData) -> RouteDecision {
        let mut decision = RouteDecision::default();
        for rule in &self.rules {
            if !rule.matcher.matches(data) {
                continue;
            }
            for target in &rule.targets {
                if !decision.targets.contains(target) {
                    decision.targets.push(target.clone());
                }
            }
            for id in &rule.transformer_ids {
                if !decision.transformer_ids.contains(id) {
                    decision.transformer_ids.push(id.clone());
                }
            }
            if !rule.continue_matching {
                break;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, KlineInterval, Metadata, Payload, TickerPayload};
    use rust_decimal_macros::dec;

    fn record(exchange: &str, symbol: &str, data_type: DataType) -> MarketData {
        MarketData {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            data_type,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Ticker(TickerPayload {
                last: dec!(1),
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                volume: dec!(1),
                quote_volume: dec!(1),
                bid: None,
                ask: None,
                price_change_pct: None,
            }),
            metadata: Metadata::new("test"),
        }
    }

    fn matcher(types: &[&str]) -> RouteMatcher {
        RouteMatcher {
            types: types.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_fields_are_wildcards() {
        let m = RouteMatcher::any();
        assert!(m.matches(&record("binance", "BTC/USDT", DataType::Trade)));
    }

    #[test]
    fn test_type_matching() {
        let m = matcher(&["ticker"]);
        assert!(m.matches(&record("binance", "BTC/USDT", DataType::Ticker)));
        assert!(!m.matches(&record("binance", "BTC/USDT", DataType::Trade)));
    }

    #[test]
    fn test_kline_bucket_matches_all_intervals() {
        let m = matcher(&["kline"]);
        assert!(m.matches(&record(
            "binance",
            "BTC/USDT",
            DataType::Kline(KlineInterval::Min5)
        )));
        assert!(m.matches(&record(
            "binance",
            "BTC/USDT",
            DataType::Kline(KlineInterval::Day1)
        )));
        assert!(!m.matches(&record("binance", "BTC/USDT", DataType::Trade)));
    }

    #[test]
    fn test_metadata_tag_matching() {
        let mut m = RouteMatcher::any();
        m.metadata_tags
            .insert("region".to_string(), "eu".to_string());
        let mut md = record("binance", "BTC/USDT", DataType::Ticker);
        assert!(!m.matches(&md));
        md.metadata.tag("region", "eu");
        assert!(m.matches(&md));
    }

    #[test]
    fn test_priority_first_match_wins() {
        let router = Router::new(vec![
            RouteRule::new("low", 1, RouteMatcher::any(), vec!["everything".to_string()]),
            RouteRule::new("high", 10, matcher(&["ticker"]), vec!["tickers".to_string()]),
        ]);
        let decision = router.route(&record("binance", "BTC/USDT", DataType::Ticker));
        assert_eq!(decision.targets, vec!["tickers"]);

        // A trade misses the high-priority rule and falls through.
        let decision = router.route(&record("binance", "BTC/USDT", DataType::Trade));
        assert_eq!(decision.targets, vec!["everything"]);
    }

    #[test]
    fn test_continue_matching_accumulates() {
        let mut audit = RouteRule::new("audit", 10, matcher(&["ticker"]), vec!["audit".to_string()]);
        audit.continue_matching = true;
        let router = Router::new(vec![
            audit,
            RouteRule::new("main", 1, RouteMatcher::any(), vec!["main".to_string()]),
        ]);
        let decision = router.route(&record("binance", "BTC/USDT", DataType::Ticker));
        assert_eq!(decision.targets, vec!["audit", "main"]);
    }

    #[test]
    fn test_no_match_is_empty() {
        let router = Router::new(vec![RouteRule::new(
            "tickers",
            1,
            matcher(&["ticker"]),
            vec!["t".to_string()],
        )]);
        assert!(router
            .route(&record("binance", "BTC/USDT", DataType::Trade))
            .is_empty());
    }
}
