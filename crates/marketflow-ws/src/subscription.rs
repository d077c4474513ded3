//! Subscription lifecycle tracking.
//!
//! Translates abstract `(symbol, kind)` pairs into stream names and tracks
//! each subscription from `pending` through `active` to a terminal state.
//! The owning connection re-establishes the full stream set on reconnect;
//! this manager records per-stream activity and failure counts.

use crate::error::{WsError, WsResult};
use crate::stream_name::{build_stream_name, StreamKind, MAX_STREAMS_PER_CONNECTION};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Created, no frame observed yet.
    Pending,
    /// At least one frame received since (re)subscribe.
    Active,
    /// Temporarily suspended by the caller.
    Paused,
    /// Errored; retryable.
    Failed,
    /// Terminal; kept only until unsubscribed.
    Cancelled,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A tracked stream subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    /// Original symbol as requested (e.g. `BTC/USDT`).
    pub symbol: String,
    pub kind: StreamKind,
    pub stream_name: String,
    pub connection_id: String,
    pub status: SubscriptionStatus,
    pub subscribed_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
}

#[derive(Default)]
struct SubscriptionTable {
    /// Keyed by stream name; one subscription per stream.
    by_stream: HashMap<String, Subscription>,
    /// First-seen stream order, preserved for URL building.
    order: Vec<String>,
}

/// Tracks subscriptions for a single connection.
pub struct SubscriptionManager {
    connection_id: String,
    max_streams: usize,
    table: RwLock<SubscriptionTable>,
}

impl SubscriptionManager {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self::with_limit(connection_id, MAX_STREAMS_PER_CONNECTION)
    }

    pub fn with_limit(connection_id: impl Into<String>, max_streams: usize) -> Self {
        Self {
            connection_id: connection_id.into(),
            max_streams,
            table: RwLock::new(SubscriptionTable::default()),
        }
    }

    /// Subscribe to `(symbol, kind)`.
    ///
    /// Duplicates (same resulting stream name) dedup onto the existing
    /// subscription and return its id. Exceeding the per-connection limit
    /// fails with `TooManyStreams`.
    pub fn subscribe(&self, symbol: &str, kind: StreamKind) -> WsResult<Uuid> {
        let stream_name = build_stream_name(symbol, &kind)?;
        let mut table = self.table.write();

        if let Some(existing) = table.by_stream.get(&stream_name) {
            debug!(stream = %stream_name, "Duplicate subscription deduped");
            return Ok(existing.id);
        }
        if table.by_stream.len() >= self.max_streams {
            return Err(WsError::TooManyStreams {
                count: table.by_stream.len() + 1,
                max: self.max_streams,
            });
        }

        let sub = Subscription {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            kind,
            stream_name: stream_name.clone(),
            connection_id: self.connection_id.clone(),
            status: SubscriptionStatus::Pending,
            subscribed_at: Utc::now(),
            last_active_at: None,
            message_count: 0,
            error_count: 0,
        };
        let id = sub.id;
        info!(stream = %stream_name, %id, "Subscription created");
        table.order.push(stream_name.clone());
        table.by_stream.insert(stream_name, sub);
        Ok(id)
    }

    /// Remove a subscription. Succeeding removal destroys the record.
    pub fn unsubscribe(&self, id: Uuid) -> WsResult<Subscription> {
        let mut table = self.table.write();
        let stream_name = table
            .by_stream
            .values()
            .find(|s| s.id == id)
            .map(|s| s.stream_name.clone())
            .ok_or_else(|| WsError::SubscriptionNotFound(id.to_string()))?;
        table.order.retain(|n| n != &stream_name);
        let sub = table.by_stream.remove(&stream_name).expect("indexed above");
        info!(stream = %stream_name, %id, "Subscription removed");
        Ok(sub)
    }

    /// Record a frame for a stream: transitions `pending`/`failed` to
    /// `active` and bumps the message counter.
    pub fn record_message(&self, stream_name: &str) {
        let mut table = self.table.write();
        if let Some(sub) = table.by_stream.get_mut(stream_name) {
            if matches!(
                sub.status,
                SubscriptionStatus::Pending | SubscriptionStatus::Failed
            ) {
                debug!(stream = %stream_name, "Subscription active");
                sub.status = SubscriptionStatus::Active;
            }
            sub.message_count += 1;
            sub.last_active_at = Some(Utc::now());
        }
    }

    /// Record a stream-level error; the subscription becomes `failed`
    /// (retryable: the next frame re-activates it).
    pub fn record_error(&self, stream_name: &str) {
        let mut table = self.table.write();
        if let Some(sub) = table.by_stream.get_mut(stream_name) {
            sub.error_count += 1;
            if sub.status != SubscriptionStatus::Cancelled {
                sub.status = SubscriptionStatus::Failed;
            }
        }
    }

    /// Pause a subscription (kept in the stream set, frames ignored by the
    /// caller).
    pub fn pause(&self, id: Uuid) -> WsResult<()> {
        self.set_status(id, SubscriptionStatus::Paused)
    }

    /// Resume a paused subscription.
    pub fn resume(&self, id: Uuid) -> WsResult<()> {
        self.set_status(id, SubscriptionStatus::Pending)
    }

    /// Cancel a subscription; terminal until unsubscribed.
    pub fn cancel(&self, id: Uuid) -> WsResult<()> {
        self.set_status(id, SubscriptionStatus::Cancelled)
    }

    fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> WsResult<()> {
        let mut table = self.table.write();
        let sub = table
            .by_stream
            .values_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| WsError::SubscriptionNotFound(id.to_string()))?;
        sub.status = status;
        Ok(())
    }

    /// Reset all non-terminal subscriptions to `pending` (called on
    /// reconnect, before the stream set is re-established).
    pub fn reset_for_reconnect(&self) {
        let mut table = self.table.write();
        for sub in table.by_stream.values_mut() {
            if !matches!(
                sub.status,
                SubscriptionStatus::Cancelled | SubscriptionStatus::Paused
            ) {
                sub.status = SubscriptionStatus::Pending;
            }
        }
        info!(count = table.by_stream.len(), "Subscriptions reset for reconnect");
    }

    /// Stream names in first-seen order (the combined URL order).
    pub fn stream_names(&self) -> Vec<String> {
        self.table.read().order.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Subscription> {
        self.table
            .read()
            .by_stream
            .values()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn by_stream_name(&self, stream_name: &str) -> Option<Subscription> {
        self.table.read().by_stream.get(stream_name).cloned()
    }

    pub fn all(&self) -> Vec<Subscription> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|name| table.by_stream.get(name))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().by_stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().by_stream.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::KlineInterval;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new("conn-1")
    }

    #[test]
    fn test_subscribe_creates_pending() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        let sub = m.get(id).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.stream_name, "btcusdt@trade");
        assert_eq!(sub.connection_id, "conn-1");
    }

    #[test]
    fn test_duplicate_dedups_to_same_id() {
        let m = manager();
        let a = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        let b = m.subscribe("BTCUSDT", StreamKind::Trade).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_limit_enforced() {
        let m = SubscriptionManager::with_limit("conn-1", 2);
        m.subscribe("AAA", StreamKind::Trade).unwrap();
        m.subscribe("BBB", StreamKind::Trade).unwrap();
        let err = m.subscribe("CCC", StreamKind::Trade).unwrap_err();
        assert!(matches!(err, WsError::TooManyStreams { .. }));
    }

    #[test]
    fn test_first_frame_activates() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.record_message("btcusdt@trade");
        let sub = m.get(id).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.message_count, 1);
        assert!(sub.last_active_at.is_some());
    }

    #[test]
    fn test_error_marks_failed_then_frame_recovers() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.record_error("btcusdt@trade");
        assert_eq!(m.get(id).unwrap().status, SubscriptionStatus::Failed);
        assert_eq!(m.get(id).unwrap().error_count, 1);

        m.record_message("btcusdt@trade");
        assert_eq!(m.get(id).unwrap().status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_cancel_is_terminal() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.cancel(id).unwrap();
        m.record_error("btcusdt@trade");
        assert_eq!(m.get(id).unwrap().status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_unsubscribe_destroys() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.unsubscribe(id).unwrap();
        assert!(m.get(id).is_none());
        assert!(m.stream_names().is_empty());
        assert!(matches!(
            m.unsubscribe(id).unwrap_err(),
            WsError::SubscriptionNotFound(_)
        ));
    }

    #[test]
    fn test_stream_names_keep_first_seen_order() {
        let m = manager();
        m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.subscribe("ETH/USDT", StreamKind::Ticker).unwrap();
        m.subscribe("BNB/USDT", StreamKind::Kline(KlineInterval::Min1))
            .unwrap();
        assert_eq!(
            m.stream_names(),
            vec!["btcusdt@trade", "ethusdt@ticker", "bnbusdt@kline_1m"]
        );
    }

    #[test]
    fn test_reset_for_reconnect() {
        let m = manager();
        let id = m.subscribe("BTC/USDT", StreamKind::Trade).unwrap();
        m.record_message("btcusdt@trade");
        assert_eq!(m.get(id).unwrap().status, SubscriptionStatus::Active);

        m.reset_for_reconnect();
        assert_eq!(m.get(id).unwrap().status, SubscriptionStatus::Pending);

        // Counters survive the reconnect.
        assert_eq!(m.get(id).unwrap().message_count, 1);
    }
}
