//! In-memory cache sink.
//!
//! Keeps the last K records per `(exchange, symbol, type)` key with a TTL.
//! Best-effort observability only: nothing is replayed from here on
//! reconnect. Bounded by K times the number of tracked keys.

use async_trait::async_trait;
use dashmap::DashMap;
use marketflow_core::MarketData;
use marketflow_flow::{FlowResult, Sink, SinkHealth};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache sink configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries kept per key (K).
    pub capacity_per_key: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_per_key: 100,
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: MarketData,
    inserted_at: Instant,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys: usize,
    pub entries: usize,
}

/// Distribution of entry ages across the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgeStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
}

type CacheKey = (String, String, String);

/// Keyed multi-value store of recent records.
pub struct CacheSink {
    id: String,
    config: CacheConfig,
    entries: DashMap<CacheKey, VecDeque<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheSink {
    pub fn new(id: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            id: id.into(),
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// All live entries for a key, oldest first.
    pub fn get(&self, exchange: &str, symbol: &str, type_name: &str) -> Vec<MarketData> {
        let key = (
            exchange.to_string(),
            symbol.to_string(),
            type_name.to_string(),
        );
        let Some(mut slot) = self.entries.get_mut(&key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        };
        Self::prune(&mut slot, self.config.ttl);
        if slot.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        slot.iter().map(|e| e.data.clone()).collect()
    }

    /// The most recent live entry for a key.
    pub fn latest(&self, exchange: &str, symbol: &str, type_name: &str) -> Option<MarketData> {
        self.get(exchange, symbol, type_name).into_iter().last()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys: self.entries.len(),
            entries: self.entries.iter().map(|slot| slot.len()).sum(),
        }
    }

    /// Age distribution over all live entries.
    pub fn age_stats(&self) -> AgeStats {
        let mut ages_ms: Vec<u64> = Vec::new();
        for mut slot in self.entries.iter_mut() {
            Self::prune(&mut slot, self.config.ttl);
            ages_ms.extend(slot.iter().map(|e| e.inserted_at.elapsed().as_millis() as u64));
        }
        if ages_ms.is_empty() {
            return AgeStats::default();
        }
        let count = ages_ms.len();
        let min_ms = *ages_ms.iter().min().unwrap();
        let max_ms = *ages_ms.iter().max().unwrap();
        let mean_ms = ages_ms.iter().sum::<u64>() as f64 / count as f64;
        AgeStats {
            count,
            min_ms,
            max_ms,
            mean_ms,
        }
    }

    fn prune(slot: &mut VecDeque<CacheEntry>, ttl: Duration) {
        while slot
            .front()
            .is_some_and(|e| e.inserted_at.elapsed() > ttl)
        {
            slot.pop_front();
        }
    }
}

#[async_trait]
impl Sink for CacheSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, batch: &[MarketData]) -> FlowResult<()> {
        let now = Instant::now();
        for data in batch {
            let mut slot = self.entries.entry(data.tuple_key()).or_default();
            Self::prune(&mut slot, self.config.ttl);
            slot.push_back(CacheEntry {
                data: data.clone(),
                inserted_at: now,
            });
            while slot.len() > self.config.capacity_per_key {
                slot.pop_front();
            }
        }
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth::healthy()
    }

    async fn close(&self) -> FlowResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, Metadata, Payload, TradePayload, TradeSide};
    use rust_decimal::Decimal;

    fn trade(symbol: &str, id: u64) -> MarketData {
        MarketData {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            data_type: DataType::Trade,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Trade(TradePayload {
                id: id.to_string(),
                price: Decimal::ONE,
                quantity: Decimal::ONE,
                side: TradeSide::Buy,
                timestamp: 1,
            }),
            metadata: Metadata::new("test"),
        }
    }

    fn cache(k: usize, ttl: Duration) -> CacheSink {
        CacheSink::new(
            "cache",
            CacheConfig {
                capacity_per_key: k,
                ttl,
            },
        )
    }

    #[tokio::test]
    async fn test_keeps_last_k_per_key() {
        let sink = cache(3, Duration::from_secs(60));
        for i in 0..5 {
            sink.write(&[trade("BTC/USDT", i)]).await.unwrap();
        }

        let entries = sink.get("binance", "BTC/USDT", "trade");
        let ids: Vec<String> = entries
            .iter()
            .map(|md| match &md.payload {
                Payload::Trade(t) => t.id.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let sink = cache(10, Duration::from_secs(60));
        sink.write(&[trade("BTC/USDT", 1), trade("ETH/USDT", 2)])
            .await
            .unwrap();

        assert_eq!(sink.get("binance", "BTC/USDT", "trade").len(), 1);
        assert_eq!(sink.get("binance", "ETH/USDT", "trade").len(), 1);
        assert_eq!(sink.stats().keys, 2);
    }

    #[tokio::test]
    async fn test_hit_miss_counters() {
        let sink = cache(10, Duration::from_secs(60));
        sink.write(&[trade("BTC/USDT", 1)]).await.unwrap();

        assert!(!sink.get("binance", "BTC/USDT", "trade").is_empty());
        assert!(sink.get("binance", "XRP/USDT", "trade").is_empty());

        let stats = sink.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let sink = cache(10, Duration::from_millis(30));
        sink.write(&[trade("BTC/USDT", 1)]).await.unwrap();
        assert_eq!(sink.get("binance", "BTC/USDT", "trade").len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.get("binance", "BTC/USDT", "trade").is_empty());
        // The expired lookup counts as a miss.
        assert_eq!(sink.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_latest_returns_newest() {
        let sink = cache(10, Duration::from_secs(60));
        sink.write(&[trade("BTC/USDT", 1), trade("BTC/USDT", 2)])
            .await
            .unwrap();

        let latest = sink.latest("binance", "BTC/USDT", "trade").unwrap();
        let Payload::Trade(t) = &latest.payload else {
            unreachable!();
        };
        assert_eq!(t.id, "2");
    }

    #[tokio::test]
    async fn test_age_stats() {
        let sink = cache(10, Duration::from_secs(60));
        sink.write(&[trade("BTC/USDT", 1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ages = sink.age_stats();
        assert_eq!(ages.count, 1);
        assert!(ages.min_ms >= 15, "age too low: {}", ages.min_ms);
    }

    #[tokio::test]
    async fn test_close_clears() {
        let sink = cache(10, Duration::from_secs(60));
        sink.write(&[trade("BTC/USDT", 1)]).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(sink.stats().entries, 0);
    }
}
