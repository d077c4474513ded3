//! End-to-end pipeline tests for the dataflow engine: backpressure,
//! per-tuple ordering, sink isolation, retry and drain behavior.

use async_trait::async_trait;
use marketflow_core::{DataType, MarketData, Metadata, Payload, TradePayload, TradeSide};
use marketflow_flow::{
    BackpressurePolicy, DataFlowEngine, DeadLetter, EnqueueResult, FlowConfig, FlowError,
    FlowResult, RejectReason, RouteMatcher, RouteRule, Router, Sink, SinkHealth,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Test sink that records every written record.
struct RecordingSink {
    id: String,
    received: Mutex<Vec<MarketData>>,
    /// Sleep before each write (simulates a slow or stalled sink).
    write_delay: Duration,
    /// Fail this many writes before succeeding.
    fail_remaining: AtomicU32,
    fail_permanently: bool,
}

impl RecordingSink {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            received: Mutex::new(Vec::new()),
            write_delay: Duration::ZERO,
            fail_remaining: AtomicU32::new(0),
            fail_permanently: false,
        })
    }

    fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            write_delay: delay,
            ..Self::unwrapped(id)
        })
    }

    fn failing(id: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicU32::new(failures),
            ..Self::unwrapped(id)
        })
    }

    fn permanently_failing(id: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicU32::new(u32::MAX),
            fail_permanently: true,
            ..Self::unwrapped(id)
        })
    }

    fn unwrapped(id: &str) -> Self {
        Self {
            id: id.to_string(),
            received: Mutex::new(Vec::new()),
            write_delay: Duration::ZERO,
            fail_remaining: AtomicU32::new(0),
            fail_permanently: false,
        }
    }

    fn trade_ids(&self) -> Vec<u64> {
        self.received
            .lock()
            .iter()
            .map(|md| match &md.payload {
                Payload::Trade(t) => t.id.parse().unwrap(),
                _ => panic!("expected trade"),
            })
            .collect()
    }

    fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, batch: &[MarketData]) -> FlowResult<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let remaining = self.fail_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_remaining.fetch_sub(1, Ordering::AcqRel);
            }
            return if self.fail_permanently {
                Err(FlowError::SinkPermanent("refused".to_string()))
            } else {
                Err(FlowError::SinkTransient("try again".to_string()))
            };
        }
        self.received.lock().extend_from_slice(batch);
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth::healthy()
    }

    async fn close(&self) -> FlowResult<()> {
        Ok(())
    }
}

struct RecordingDeadLetter {
    batches: Mutex<Vec<(Vec<MarketData>, String)>>,
}

impl DeadLetter for RecordingDeadLetter {
    fn dead_letter(&self, batch: Vec<MarketData>, reason: &str) {
        self.batches.lock().push((batch, reason.to_string()));
    }
}

fn trade(symbol: &str, id: u64) -> MarketData {
    MarketData {
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        data_type: DataType::Trade,
        event_timestamp: 1_699_000_000_000 + id as i64,
        received_timestamp: 1_699_000_000_000 + id as i64,
        payload: Payload::Trade(TradePayload {
            id: id.to_string(),
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            side: TradeSide::Buy,
            timestamp: 1_699_000_000_000 + id as i64,
        }),
        metadata: Metadata::new("test"),
    }
}

fn route_all_to(targets: &[&str]) -> Router {
    Router::new(vec![RouteRule::new(
        "all",
        0,
        RouteMatcher::any(),
        targets.iter().map(|s| s.to_string()).collect(),
    )])
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_drop_oldest_backpressure() {
    // Q=100, drop_oldest, 150 submits before the engine runs: the first 50
    // are evicted, the sink observes 51..150 in order.
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "bp".to_string(),
        ingress_capacity: 100,
        backpressure: BackpressurePolicy::DropOldest,
        ..Default::default()
    });
    let sink = RecordingSink::new("sink");
    engine.set_router(route_all_to(&["sink"]));
    engine.register_sink(sink.clone());
    let handle = engine.handle();

    for i in 1..=150u64 {
        assert_eq!(
            handle.submit(trade("BTC/USDT", i)).await,
            EnqueueResult::Accepted
        );
    }
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.backpressure_drops, 50);
    assert_eq!(snapshot.submit_accepted, 150);
    assert_eq!(snapshot.ingress_depth, 100);

    let engine_task = tokio::spawn(engine.run());
    assert!(wait_until(Duration::from_secs(5), || sink.count() == 100).await);

    let ids = sink.trade_ids();
    assert_eq!(ids.len(), 100);
    assert_eq!(&ids[..50], (51..=100).collect::<Vec<_>>().as_slice());
    assert_eq!(ids, (51..=150).collect::<Vec<_>>());

    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_drop_new_rejects_immediately() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "dropnew".to_string(),
        ingress_capacity: 2,
        backpressure: BackpressurePolicy::DropNew,
        ..Default::default()
    });
    engine.set_router(route_all_to(&["sink"]));
    engine.register_sink(RecordingSink::new("sink"));
    let handle = engine.handle();

    assert_eq!(handle.submit(trade("A/B", 1)).await, EnqueueResult::Accepted);
    assert_eq!(handle.submit(trade("A/B", 2)).await, EnqueueResult::Accepted);
    assert_eq!(
        handle.submit(trade("A/B", 3)).await,
        EnqueueResult::Rejected(RejectReason::Backpressure)
    );
    assert_eq!(handle.snapshot().submit_rejected, 1);
}

#[tokio::test]
async fn test_block_policy_bounded_wait() {
    // A full ingress with Block policy holds the producer for at most
    // submit_timeout, then rejects: no unbounded blocking.
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "block".to_string(),
        ingress_capacity: 1,
        backpressure: BackpressurePolicy::Block,
        submit_timeout: Duration::from_millis(30),
        ..Default::default()
    });
    engine.set_router(route_all_to(&["sink"]));
    engine.register_sink(RecordingSink::new("sink"));
    let handle = engine.handle();

    assert_eq!(handle.submit(trade("A/B", 1)).await, EnqueueResult::Accepted);
    let started = std::time::Instant::now();
    assert_eq!(
        handle.submit(trade("A/B", 2)).await,
        EnqueueResult::Rejected(RejectReason::Backpressure)
    );
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(25), "returned too early: {waited:?}");
    assert!(waited < Duration::from_secs(1), "blocked too long: {waited:?}");
}

#[tokio::test]
async fn test_per_tuple_fifo_across_interleaved_symbols() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "fifo".to_string(),
        batch_size: 7,
        batch_timeout: Duration::from_millis(10),
        ..Default::default()
    });
    let sink = RecordingSink::new("sink");
    engine.set_router(route_all_to(&["sink"]));
    engine.register_sink(sink.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    // Interleave three tuples; ids encode per-symbol sequence.
    let symbols = ["BTC/USDT", "ETH/USDT", "SOL/USDT"];
    for seq in 0..50u64 {
        for (s, symbol) in symbols.iter().enumerate() {
            let id = seq * 10 + s as u64;
            assert_eq!(
                handle.submit(trade(symbol, id)).await,
                EnqueueResult::Accepted
            );
        }
    }

    assert!(wait_until(Duration::from_secs(5), || sink.count() == 150).await);

    // Flattened across batches, each tuple's subsequence is in submit order.
    let received = sink.received.lock().clone();
    for (s, symbol) in symbols.iter().enumerate() {
        let seq: Vec<u64> = received
            .iter()
            .filter(|md| md.symbol == *symbol)
            .map(|md| match &md.payload {
                Payload::Trade(t) => t.id.parse().unwrap(),
                _ => unreachable!(),
            })
            .collect();
        let expected: Vec<u64> = (0..50u64).map(|seq| seq * 10 + s as u64).collect();
        assert_eq!(seq, expected, "tuple {symbol} out of order");
    }

    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_stalled_sink_does_not_couple_others() {
    // Sink A stalls on every write; B and C stay healthy. B and C must
    // receive everything while A's outbox fills and then drops copies.
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "isolation".to_string(),
        outbox_capacity: 10,
        batch_size: 10,
        batch_timeout: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(1),
        sink_drain_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let slow = RecordingSink::slow("a", Duration::from_secs(30));
    let fast_b = RecordingSink::new("b");
    let fast_c = RecordingSink::new("c");
    engine.set_router(route_all_to(&["a", "b", "c"]));
    engine.register_sink(slow.clone());
    engine.register_sink(fast_b.clone());
    engine.register_sink(fast_c.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    for i in 0..200u64 {
        assert_eq!(
            handle.submit(trade("BTC/USDT", i)).await,
            EnqueueResult::Accepted
        );
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            fast_b.count() == 200 && fast_c.count() == 200
        })
        .await,
        "healthy sinks starved by a stalled peer"
    );

    let snapshot = handle.snapshot();
    let a = &snapshot.sinks["a"];
    // A accepted a bounded number of copies and dropped the rest.
    assert!(a.routed <= 20, "stalled sink absorbed too much: {}", a.routed);
    assert!(a.outbox_drops > 0);
    assert!(a.outbox_depth <= 10);
    assert_eq!(snapshot.sinks["b"].written, 200);
    assert_eq!(snapshot.sinks["c"].written, 200);

    // Force-stop: the stalled worker abandons its outbox.
    handle.stop();
    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_transient_errors_retried_until_success() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "retry".to_string(),
        sink_base_delay: Duration::from_millis(1),
        sink_max_retries: 3,
        batch_timeout: Duration::from_millis(5),
        ..Default::default()
    });
    let sink = RecordingSink::failing("flaky", 2);
    engine.set_router(route_all_to(&["flaky"]));
    engine.register_sink(sink.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    handle.submit(trade("BTC/USDT", 1)).await;
    assert!(wait_until(Duration::from_secs(5), || sink.count() == 1).await);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.sinks["flaky"].retries, 2);
    assert_eq!(snapshot.sinks["flaky"].errors, 2);
    assert_eq!(snapshot.sinks["flaky"].permanent_loss, 0);

    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_without_dlq_is_permanent_loss() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "loss".to_string(),
        sink_base_delay: Duration::from_millis(1),
        sink_max_retries: 2,
        batch_timeout: Duration::from_millis(5),
        ..Default::default()
    });
    let sink = RecordingSink::failing("bad", u32::MAX - 1);
    engine.set_router(route_all_to(&["bad"]));
    engine.register_sink(sink.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    handle.submit(trade("BTC/USDT", 1)).await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            handle.snapshot().sinks["bad"].permanent_loss == 1
        })
        .await
    );
    assert_eq!(handle.snapshot().sinks["bad"].retries, 2);

    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_permanent_error_skips_retries_and_dead_letters() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "dlq".to_string(),
        sink_base_delay: Duration::from_millis(1),
        batch_timeout: Duration::from_millis(5),
        ..Default::default()
    });
    let sink = RecordingSink::permanently_failing("rejecting");
    let dlq = Arc::new(RecordingDeadLetter {
        batches: Mutex::new(Vec::new()),
    });
    engine.set_router(route_all_to(&["rejecting"]));
    engine.register_sink(sink);
    engine.set_dead_letter(dlq.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    handle.submit(trade("BTC/USDT", 7)).await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            handle.snapshot().sinks["rejecting"].dead_lettered == 1
        })
        .await
    );

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.sinks["rejecting"].retries, 0);
    assert_eq!(snapshot.sinks["rejecting"].permanent_loss, 0);
    {
        let batches = dlq.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 1);
    }

    handle.stop();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_drains_everything() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "drain".to_string(),
        batch_timeout: Duration::from_millis(5),
        ..Default::default()
    });
    let sink = RecordingSink::new("sink");
    engine.set_router(route_all_to(&["sink"]));
    engine.register_sink(sink.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    for i in 0..25u64 {
        handle.submit(trade("BTC/USDT", i)).await;
    }
    handle.stop();
    engine_task.await.unwrap();

    // Everything submitted before stop was delivered.
    assert_eq!(sink.count(), 25);
    assert_eq!(handle.snapshot().ingress_depth, 0);

    // New submits after stop are refused.
    assert_eq!(
        handle.submit(trade("BTC/USDT", 99)).await,
        EnqueueResult::Rejected(RejectReason::Stopped)
    );
}

#[tokio::test]
async fn test_unrouted_messages_counted_and_dropped() {
    let mut engine = DataFlowEngine::new(FlowConfig {
        name: "unrouted".to_string(),
        ..Default::default()
    });
    // Router only matches tickers; trades fall through.
    let matcher = RouteMatcher {
        types: ["ticker".to_string()].into_iter().collect(),
        ..Default::default()
    };
    engine.set_router(Router::new(vec![RouteRule::new(
        "tickers",
        0,
        matcher,
        vec!["sink".to_string()],
    )]));
    let sink = RecordingSink::new("sink");
    engine.register_sink(sink.clone());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    handle.submit(trade("BTC/USDT", 1)).await;
    assert!(wait_until(Duration::from_secs(2), || {
        handle.snapshot().unrouted == 1
    })
    .await);
    assert_eq!(sink.count(), 0);

    handle.stop();
    engine_task.await.unwrap();
}
