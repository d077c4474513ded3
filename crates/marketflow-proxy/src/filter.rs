//! Client filters and the subscription index.
//!
//! A filter matches a message iff every non-empty dimension contains the
//! message's value. Filters are stored per client and reverse-indexed by
//! each non-empty dimension so matching touches only candidate clients;
//! clients with all dimensions empty live in a broadcast set.

use crate::protocol::FilterRequest;
use marketflow_core::MarketData;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A per-client subscription filter. Empty set = wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFilter {
    pub exchanges: HashSet<String>,
    pub symbols: HashSet<String>,
    pub types: HashSet<String>,
}

impl ClientFilter {
    pub fn from_request(request: &FilterRequest) -> Self {
        let to_set = |v: &Option<Vec<String>>| {
            v.as_ref()
                .map(|items| items.iter().cloned().collect())
                .unwrap_or_default()
        };
        Self {
            exchanges: to_set(&request.exchange),
            symbols: to_set(&request.symbols),
            types: to_set(&request.data_types),
        }
    }

    /// All dimensions empty: the client wants everything.
    pub fn is_broadcast(&self) -> bool {
        self.exchanges.is_empty() && self.symbols.is_empty() && self.types.is_empty()
    }

    /// Every non-empty dimension must contain the message's value.
    pub fn matches(&self, data: &MarketData) -> bool {
        if !self.exchanges.is_empty() && !self.exchanges.contains(&data.exchange) {
            return false;
        }
        if !self.symbols.is_empty() && !self.symbols.contains(&data.symbol) {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(&data.data_type.as_str()) {
            return false;
        }
        true
    }
}

/// Reverse index over client filters.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    /// All filters, by client then filter id.
    filters: HashMap<Uuid, HashMap<Uuid, ClientFilter>>,
    by_exchange: HashMap<String, HashSet<Uuid>>,
    by_symbol: HashMap<String, HashSet<Uuid>>,
    by_type: HashMap<String, HashSet<Uuid>>,
    /// Clients holding at least one all-wildcard filter.
    broadcast: HashSet<Uuid>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a filter for a client and index its non-empty dimensions.
    pub fn add_filter(&mut self, client_id: Uuid, filter: ClientFilter) -> Uuid {
        let filter_id = Uuid::new_v4();
        if filter.is_broadcast() {
            self.broadcast.insert(client_id);
        }
        for exchange in &filter.exchanges {
            self.by_exchange
                .entry(exchange.clone())
                .or_default()
                .insert(client_id);
        }
        for symbol in &filter.symbols {
            self.by_symbol
                .entry(symbol.clone())
                .or_default()
                .insert(client_id);
        }
        for data_type in &filter.types {
            self.by_type
                .entry(data_type.clone())
                .or_default()
                .insert(client_id);
        }
        self.filters
            .entry(client_id)
            .or_default()
            .insert(filter_id, filter);
        filter_id
    }

    /// Remove one filter. Returns false when unknown.
    pub fn remove_filter(&mut self, client_id: Uuid, filter_id: Uuid) -> bool {
        let Some(client_filters) = self.filters.get_mut(&client_id) else {
            return false;
        };
        if client_filters.remove(&filter_id).is_none() {
            return false;
        }
        if client_filters.is_empty() {
            self.filters.remove(&client_id);
        }
        self.reindex_client(client_id);
        true
    }

    /// Remove every filter a client holds.
    pub fn remove_client(&mut self, client_id: Uuid) {
        self.filters.remove(&client_id);
        self.reindex_client(client_id);
    }

    /// Rebuild the dimension entries for one client from its remaining
    /// filters. Filter counts per client are small; this stays cheap.
    fn reindex_client(&mut self, client_id: Uuid) {
        for index in [
            &mut self.by_exchange,
            &mut self.by_symbol,
            &mut self.by_type,
        ] {
            for members in index.values_mut() {
                members.remove(&client_id);
            }
            index.retain(|_, members| !members.is_empty());
        }
        self.broadcast.remove(&client_id);

        if let Some(filters) = self.filters.get(&client_id) {
            let filters: Vec<ClientFilter> = filters.values().cloned().collect();
            for filter in filters {
                if filter.is_broadcast() {
                    self.broadcast.insert(client_id);
                }
                for exchange in &filter.exchanges {
                    self.by_exchange
                        .entry(exchange.clone())
                        .or_default()
                        .insert(client_id);
                }
                for symbol in &filter.symbols {
                    self.by_symbol
                        .entry(symbol.clone())
                        .or_default()
                        .insert(client_id);
                }
                for data_type in &filter.types {
                    self.by_type
                        .entry(data_type.clone())
                        .or_default()
                        .insert(client_id);
                }
            }
        }
    }

    /// Clients that should receive this message, each at most once.
    ///
    /// Candidates come from the per-dimension index entries for the
    /// message's values (smallest set walked first) plus the broadcast set;
    /// every candidate is then verified against its full filters.
    pub fn match_clients(&self, data: &MarketData) -> Vec<Uuid> {
        let type_name = data.data_type.as_str();
        let empty = HashSet::new();
        let mut candidate_sets: Vec<&HashSet<Uuid>> = vec![
            self.by_exchange.get(&data.exchange).unwrap_or(&empty),
            self.by_symbol.get(&data.symbol).unwrap_or(&empty),
            self.by_type.get(&type_name).unwrap_or(&empty),
        ];
        candidate_sets.sort_by_key(|s| s.len());

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut matched = Vec::new();

        for client_id in self.broadcast.iter() {
            if seen.insert(*client_id) {
                matched.push(*client_id);
            }
        }
        for set in candidate_sets {
            for client_id in set {
                if !seen.insert(*client_id) {
                    continue;
                }
                let matches = self
                    .filters
                    .get(client_id)
                    .is_some_and(|filters| filters.values().any(|f| f.matches(data)));
                if matches {
                    matched.push(*client_id);
                }
            }
        }
        matched
    }

    pub fn filter_count(&self, client_id: Uuid) -> usize {
        self.filters.get(&client_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn filter_ids(&self, client_id: Uuid) -> Vec<Uuid> {
        self.filters
            .get(&client_id)
            .map(|filters| filters.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn total_filters(&self) -> usize {
        self.filters.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, Metadata, Payload, TickerPayload};
    use rust_decimal::Decimal;

    fn record(exchange: &str, symbol: &str, data_type: DataType) -> MarketData {
        MarketData {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            data_type,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Ticker(TickerPayload {
                last: Decimal::ONE,
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                volume: Decimal::ONE,
                quote_volume: Decimal::ONE,
                bid: None,
                ask: None,
                price_change_pct: None,
            }),
            metadata: Metadata::new("test"),
        }
    }

    fn symbols_filter(symbols: &[&str]) -> ClientFilter {
        ClientFilter {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn types_filter(types: &[&str]) -> ClientFilter {
        ClientFilter {
            types: types.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fanout_scenario() {
        // A: symbols=[BTC/USDT]; B: types=[ticker].
        let mut index = SubscriptionIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add_filter(a, symbols_filter(&["BTC/USDT"]));
        index.add_filter(b, types_filter(&["ticker"]));

        // A trade on BTC/USDT: A only.
        let m = record("binance", "BTC/USDT", DataType::Trade);
        let matched = index.match_clients(&m);
        assert_eq!(matched, vec![a]);

        // A ticker on ETH/USDT: B only.
        let m = record("binance", "ETH/USDT", DataType::Ticker);
        let matched = index.match_clients(&m);
        assert_eq!(matched, vec![b]);

        // A ticker on BTC/USDT: both, exactly once each.
        let m = record("binance", "BTC/USDT", DataType::Ticker);
        let matched = index.match_clients(&m);
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&a) && matched.contains(&b));
    }

    #[test]
    fn test_all_dimensions_must_match() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        index.add_filter(
            c,
            ClientFilter {
                exchanges: ["binance".to_string()].into_iter().collect(),
                symbols: ["BTC/USDT".to_string()].into_iter().collect(),
                types: ["trade".to_string()].into_iter().collect(),
            },
        );

        assert_eq!(
            index.match_clients(&record("binance", "BTC/USDT", DataType::Trade)),
            vec![c]
        );
        // One dimension off: no delivery.
        assert!(index
            .match_clients(&record("kraken", "BTC/USDT", DataType::Trade))
            .is_empty());
        assert!(index
            .match_clients(&record("binance", "ETH/USDT", DataType::Trade))
            .is_empty());
        assert!(index
            .match_clients(&record("binance", "BTC/USDT", DataType::Ticker))
            .is_empty());
    }

    #[test]
    fn test_broadcast_subscriber_gets_everything() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        index.add_filter(c, ClientFilter::default());

        assert_eq!(
            index.match_clients(&record("binance", "BTC/USDT", DataType::Trade)),
            vec![c]
        );
        assert_eq!(
            index.match_clients(&record("kraken", "XRP/USD", DataType::Ticker)),
            vec![c]
        );
    }

    #[test]
    fn test_client_with_multiple_filters_delivered_once() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        index.add_filter(c, symbols_filter(&["BTC/USDT"]));
        index.add_filter(c, types_filter(&["trade"]));

        let matched = index.match_clients(&record("binance", "BTC/USDT", DataType::Trade));
        assert_eq!(matched, vec![c]);
    }

    #[test]
    fn test_remove_filter() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        let f = index.add_filter(c, symbols_filter(&["BTC/USDT"]));
        assert_eq!(index.filter_count(c), 1);

        assert!(index.remove_filter(c, f));
        assert_eq!(index.filter_count(c), 0);
        assert!(index
            .match_clients(&record("binance", "BTC/USDT", DataType::Trade))
            .is_empty());

        assert!(!index.remove_filter(c, f));
    }

    #[test]
    fn test_remove_client_clears_index() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        index.add_filter(c, symbols_filter(&["BTC/USDT"]));
        index.add_filter(c, ClientFilter::default());

        index.remove_client(c);
        assert_eq!(index.total_filters(), 0);
        assert!(index
            .match_clients(&record("binance", "BTC/USDT", DataType::Trade))
            .is_empty());
    }

    #[test]
    fn test_kline_type_exact_match() {
        let mut index = SubscriptionIndex::new();
        let c = Uuid::new_v4();
        index.add_filter(c, types_filter(&["kline_5m"]));

        assert_eq!(
            index
                .match_clients(&record(
                    "binance",
                    "BTC/USDT",
                    DataType::Kline(marketflow_core::KlineInterval::Min5)
                ))
                .len(),
            1
        );
        assert!(index
            .match_clients(&record(
                "binance",
                "BTC/USDT",
                DataType::Kline(marketflow_core::KlineInterval::Min1)
            ))
            .is_empty());
    }
}
