//! Per-sink bounded outbox.
//!
//! A FIFO behind a `parking_lot::Mutex`, with `Notify` handles on both
//! sides: the router waits on `space`, the sink worker waits on `data`.

use marketflow_core::MarketData;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

/// What happens when a sink's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboxPolicy {
    /// Drop the sink's copy and count the loss. Keeps sinks isolated.
    #[default]
    Drop,
    /// Hold the message in the engine's bounded stall buffer until the
    /// outbox has room; backpressure propagates to ingress when the stall
    /// buffer fills too.
    Block,
}

/// A routed message in flight.
#[derive(Debug, Clone)]
pub struct FlowMessage {
    pub data: MarketData,
    /// Stamped at submit, for end-to-end latency.
    pub enqueued_at: Instant,
    pub attempts: u32,
}

impl FlowMessage {
    pub fn new(data: MarketData) -> Self {
        Self {
            data,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }

    /// The per-tuple ordering key.
    pub fn routing_key(&self) -> (String, String, String) {
        self.data.tuple_key()
    }
}

/// Bounded FIFO between the router and one sink worker.
pub struct Outbox {
    capacity: usize,
    queue: Mutex<VecDeque<FlowMessage>>,
    /// Notified when the worker frees space.
    pub space: Notify,
    /// Notified when the router enqueues.
    pub data: Notify,
    /// Set during shutdown: the worker drains and exits.
    closed: AtomicBool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            space: Notify::new(),
            data: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking push; hands the message back when at capacity.
    pub fn push(&self, msg: FlowMessage) -> Result<(), FlowMessage> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(msg);
        }
        queue.push_back(msg);
        drop(queue);
        self.data.notify_one();
        Ok(())
    }

    /// Pop up to `max` messages, preserving order.
    pub fn pop_up_to(&self, max: usize) -> Vec<FlowMessage> {
        if max == 0 {
            return Vec::new();
        }
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        let drained: Vec<FlowMessage> = queue.drain(..n).collect();
        drop(queue);
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }

    /// Drain everything (force shutdown accounting).
    pub fn drain_all(&self) -> Vec<FlowMessage> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{DataType, Metadata, Payload, TradePayload, TradeSide};
    use rust_decimal::Decimal;

    fn msg(id: u32) -> FlowMessage {
        FlowMessage::new(MarketData {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
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
        })
    }

    fn trade_id(m: &FlowMessage) -> String {
        match &m.data.payload {
            Payload::Trade(t) => t.id.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fifo_and_capacity() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(msg(1)).is_ok());
        assert!(outbox.push(msg(2)).is_ok());
        let rejected = outbox.push(msg(3)).unwrap_err();
        assert_eq!(trade_id(&rejected), "3");
        assert_eq!(outbox.len(), 2);

        let popped = outbox.pop_up_to(10);
        assert_eq!(
            popped.iter().map(trade_id).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }

    #[test]
    fn test_pop_up_to_partial() {
        let outbox = Outbox::new(10);
        for i in 0..5 {
            outbox.push(msg(i)).unwrap();
        }
        assert_eq!(outbox.pop_up_to(3).len(), 3);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_close_flag() {
        let outbox = Outbox::new(1);
        assert!(!outbox.is_closed());
        outbox.close();
        assert!(outbox.is_closed());
    }
}
