//! Proxy core: client registry, subscription index and fan-out.
//!
//! `forward_message` is synchronous and never suspends: it serializes the
//! record once and `try_send`s into each target's bounded outbound queue. A
//! full queue marks that client for closure with `slow_consumer`.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::filter::{ClientFilter, SubscriptionIndex};
use crate::protocol::{Envelope, FilterRequest};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use marketflow_core::MarketData;
use marketflow_telemetry::metrics;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A frame queued for one client's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Pre-serialized JSON envelope.
    Text(String),
    /// WebSocket ping frame.
    Ping,
}

/// Per-client bookkeeping held by the proxy.
pub struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
    kill: CancellationToken,
    close_reason: Mutex<Option<(u16, String)>>,
    pub connected_at: DateTime<Utc>,
}

impl ClientHandle {
    /// Record the close code once and wake the writer.
    fn close_with(&self, code: u16, reason: &str) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some((code, reason.to_string()));
        }
        drop(slot);
        self.kill.cancel();
    }
}

/// Point-in-time proxy statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProxyStatsSnapshot {
    pub clients: usize,
    pub max_clients: usize,
    pub total_filters: usize,
    pub forwarded: u64,
    pub slow_consumer_drops: u64,
}

/// The fan-out proxy core. Shared behind `Arc` between the axum handlers
/// and the proxy sink.
pub struct WebSocketProxy {
    config: ProxyConfig,
    clients: DashMap<Uuid, ClientHandle>,
    index: RwLock<SubscriptionIndex>,
    forwarded: AtomicU64,
    slow_consumer_drops: AtomicU64,
}

impl WebSocketProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            index: RwLock::new(SubscriptionIndex::new()),
            forwarded: AtomicU64::new(0),
            slow_consumer_drops: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Register a new client connection. `None` when at capacity.
    pub fn try_register(&self) -> Option<(Uuid, mpsc::Receiver<Outbound>, CancellationToken)> {
        if self.clients.len() >= self.config.max_clients {
            warn!(
                clients = self.clients.len(),
                max = self.config.max_clients,
                "Client capacity reached"
            );
            return None;
        }
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let kill = CancellationToken::new();
        self.clients.insert(
            client_id,
            ClientHandle {
                tx,
                kill: kill.clone(),
                close_reason: Mutex::new(None),
                connected_at: Utc::now(),
            },
        );
        metrics::PROXY_CLIENTS
            .with_label_values(&["ws"])
            .set(self.clients.len() as i64);
        info!(client_id = %client_id, clients = self.clients.len(), "Client connected");
        Some((client_id, rx, kill))
    }

    /// Drop a client and all of its filters.
    pub fn unregister(&self, client_id: Uuid) {
        self.clients.remove(&client_id);
        self.index.write().remove_client(client_id);
        metrics::PROXY_CLIENTS
            .with_label_values(&["ws"])
            .set(self.clients.len() as i64);
        info!(client_id = %client_id, clients = self.clients.len(), "Client disconnected");
    }

    /// Store a filter for a client.
    pub fn subscribe(&self, client_id: Uuid, request: &FilterRequest) -> Uuid {
        let filter = ClientFilter::from_request(request);
        let filter_id = self.index.write().add_filter(client_id, filter);
        debug!(client_id = %client_id, filter_id = %filter_id, "Filter added");
        filter_id
    }

    /// Remove one filter, or all of a client's filters when `filter_id` is
    /// `None`. Returns the removed filter ids.
    pub fn unsubscribe(&self, client_id: Uuid, filter_id: Option<Uuid>) -> Vec<Uuid> {
        let mut index = self.index.write();
        match filter_id {
            Some(id) => {
                if index.remove_filter(client_id, id) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            None => {
                let ids = index.filter_ids(client_id);
                index.remove_client(client_id);
                ids
            }
        }
    }

    /// Fan one record out to every matching client (or an explicit target
    /// list). Serializes at most once, never suspends, returns the number
    /// of clients the frame was queued for.
    pub fn forward_message(&self, data: &MarketData, targets: Option<&[Uuid]>) -> usize {
        let matched: Vec<Uuid> = match targets {
            Some(t) => t.to_vec(),
            None => self.index.read().match_clients(data),
        };
        metrics::PROXY_FANOUT_SIZE
            .with_label_values(&["ws"])
            .observe(matched.len() as f64);
        if matched.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let frame = Envelope::new("data", data).to_json();
        metrics::PROXY_SERIALIZE_MS
            .with_label_values(&["ws"])
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        let mut delivered = 0usize;
        for client_id in matched {
            if self.try_send(client_id, Outbound::Text(frame.clone())) {
                delivered += 1;
            }
        }
        self.forwarded.fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::PROXY_FORWARDED
            .with_label_values(&["ws"])
            .inc_by(delivered as f64);
        delivered
    }

    /// Queue a control envelope for one client.
    pub fn send_control(&self, client_id: Uuid, envelope: Envelope) -> bool {
        self.try_send(client_id, Outbound::Text(envelope.to_json()))
    }

    /// Queue a WebSocket ping frame for one client.
    pub fn send_ping(&self, client_id: Uuid) -> bool {
        self.try_send(client_id, Outbound::Ping)
    }

    fn try_send(&self, client_id: Uuid, frame: Outbound) -> bool {
        let Some(handle) = self.clients.get(&client_id) else {
            return false;
        };
        match handle.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.slow_consumer_drops.fetch_add(1, Ordering::Relaxed);
                metrics::PROXY_SLOW_CONSUMER_DROPS
                    .with_label_values(&["ws"])
                    .inc();
                let error = ProxyError::SlowConsumer;
                warn!(client_id = %client_id, %error, "Outbound queue full, closing client");
                if let Some((code, reason)) = error.close_frame() {
                    handle.close_with(code, reason);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the writer task to close this client with a code.
    pub fn request_close(&self, client_id: Uuid, code: u16, reason: &str) {
        if let Some(handle) = self.clients.get(&client_id) {
            handle.close_with(code, reason);
        }
    }

    /// The close code recorded for a client, if any.
    pub fn close_reason(&self, client_id: Uuid) -> Option<(u16, String)> {
        self.clients
            .get(&client_id)
            .and_then(|handle| handle.close_reason.lock().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn filter_count(&self, client_id: Uuid) -> usize {
        self.index.read().filter_count(client_id)
    }

    pub fn stats(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            clients: self.clients.len(),
            max_clients: self.config.max_clients,
            total_filters: self.index.read().total_filters(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            slow_consumer_drops: self.slow_consumer_drops.load(Ordering::Relaxed),
        }
    }

    /// Connected-at timestamp for a client, when still registered.
    pub fn connected_at(&self, client_id: Uuid) -> Option<DateTime<Utc>> {
        self.clients.get(&client_id).map(|h| h.connected_at)
    }
}

/// Convenience alias used by the sink integration.
pub type SharedProxy = Arc<WebSocketProxy>;

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, Metadata, Payload, TradePayload, TradeSide};
    use rust_decimal::Decimal;

    fn trade(symbol: &str) -> MarketData {
        MarketData {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            data_type: DataType::Trade,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Trade(TradePayload {
                id: "1".to_string(),
                price: Decimal::ONE,
                quantity: Decimal::ONE,
                side: TradeSide::Buy,
                timestamp: 1,
            }),
            metadata: Metadata::new("test"),
        }
    }

    fn proxy_with_capacity(max_clients: usize) -> WebSocketProxy {
        WebSocketProxy::new(ProxyConfig {
            max_clients,
            outbound_queue: 4,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let proxy = proxy_with_capacity(2);
        let a = proxy.try_register();
        let b = proxy.try_register();
        assert!(a.is_some() && b.is_some());
        assert!(proxy.try_register().is_none());

        let (id, _rx, _kill) = a.unwrap();
        proxy.unregister(id);
        assert!(proxy.try_register().is_some());
    }

    #[tokio::test]
    async fn test_forward_counts_recipients() {
        let proxy = proxy_with_capacity(10);
        let (a, mut rx_a, _kill_a) = proxy.try_register().unwrap();
        let (b, _rx_b, _kill_b) = proxy.try_register().unwrap();

        proxy.subscribe(
            a,
            &FilterRequest {
                symbols: Some(vec!["BTC/USDT".to_string()]),
                ..Default::default()
            },
        );
        proxy.subscribe(
            b,
            &FilterRequest {
                symbols: Some(vec!["ETH/USDT".to_string()]),
                ..Default::default()
            },
        );

        assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 1);
        assert_eq!(proxy.forward_message(&trade("XRP/USDT"), None), 0);

        let Outbound::Text(frame) = rx_a.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert!(frame.contains(r#""type":"data""#));
        assert!(frame.contains("BTC/USDT"));
    }

    #[tokio::test]
    async fn test_slow_consumer_marked_for_close() {
        let proxy = proxy_with_capacity(10);
        // Queue depth 4; the receiver is never drained.
        let (a, _rx, kill) = proxy.try_register().unwrap();
        proxy.subscribe(a, &FilterRequest::default());

        for _ in 0..4 {
            assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 1);
        }
        // Fifth frame overflows: dropped, client marked slow_consumer.
        assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 0);
        assert!(kill.is_cancelled());
        assert_eq!(
            proxy.close_reason(a),
            Some((crate::CLOSE_SLOW_CONSUMER, "slow_consumer".to_string()))
        );
        assert_eq!(proxy.stats().slow_consumer_drops, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let proxy = proxy_with_capacity(10);
        let (a, _rx, _kill) = proxy.try_register().unwrap();
        proxy.subscribe(a, &FilterRequest::default());
        proxy.subscribe(
            a,
            &FilterRequest {
                symbols: Some(vec!["BTC/USDT".to_string()]),
                ..Default::default()
            },
        );
        assert_eq!(proxy.filter_count(a), 2);

        let removed = proxy.unsubscribe(a, None);
        assert_eq!(removed.len(), 2);
        assert_eq!(proxy.filter_count(a), 0);
        assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 0);
    }

    #[tokio::test]
    async fn test_explicit_targets_bypass_index() {
        let proxy = proxy_with_capacity(10);
        let (a, mut rx_a, _kill) = proxy.try_register().unwrap();
        // No subscription at all, but an explicit target list delivers.
        assert_eq!(proxy.forward_message(&trade("BTC/USDT"), Some(&[a])), 1);
        assert!(rx_a.recv().await.is_some());
    }
}
