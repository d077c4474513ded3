//! The dataflow engine.
//!
//! A single cooperative loop owns all pipeline state: it drains the bounded
//! ingress queue, applies the transformer chain, routes each record and
//! fans copies out into per-sink outboxes. One serial worker per sink
//! drains its outbox into batches and calls `sink.write` with retry and
//! backoff. Cross-component traffic is bounded queues only; the metrics
//! counters are the single shared-state exception and are all atomic.

use crate::outbox::{FlowMessage, Outbox, OutboxPolicy};
use crate::router::Router;
use crate::sink::{DeadLetter, Sink, SinkHealth};
use crate::transformer::Transformer;
use marketflow_core::MarketData;
use marketflow_telemetry::metrics;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an idle engine loop or worker parks before re-checking.
const IDLE_WAIT: Duration = Duration::from_millis(50);
/// How long the loop waits for outbox space when a Block-policy sink has a
/// full stall buffer.
const STALL_WAIT: Duration = Duration::from_millis(10);

/// Producer behavior when the ingress queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait up to `submit_timeout` for space, then reject.
    #[default]
    Block,
    /// Evict the oldest queued message and accept the new one.
    DropOldest,
    /// Reject the new message immediately.
    DropNew,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Engine name, used in logs and metric labels.
    pub name: String,
    /// Ingress queue capacity (Q).
    pub ingress_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Upper bound on producer blocking in `submit`.
    pub submit_timeout: Duration,
    /// Messages pulled from ingress per tick (N).
    pub tick_batch: usize,
    /// Default per-sink outbox capacity (O).
    pub outbox_capacity: usize,
    /// Default batch closure parameters.
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Sink write retry budget and backoff.
    pub sink_max_retries: u32,
    pub sink_base_delay: Duration,
    pub sink_max_delay: Duration,
    /// Cap on concurrent `sink.write` calls across all sink workers.
    pub sink_parallelism: usize,
    /// Graceful stop budget.
    pub drain_timeout: Duration,
    /// Extra budget for in-flight sink writes after drain.
    pub sink_drain_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            ingress_capacity: 10_000,
            backpressure: BackpressurePolicy::Block,
            submit_timeout: Duration::from_millis(50),
            tick_batch: 256,
            outbox_capacity: 1_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            sink_max_retries: 3,
            sink_base_delay: Duration::from_millis(50),
            sink_max_delay: Duration::from_secs(5),
            sink_parallelism: 8,
            drain_timeout: Duration::from_secs(10),
            sink_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-sink registration options overriding engine defaults.
#[derive(Debug, Clone, Default)]
pub struct SinkOptions {
    pub outbox_capacity: Option<usize>,
    pub policy: OutboxPolicy,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
}

/// Result of `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Backpressure,
    Stopped,
}

/// Engine-level counters.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub submit_accepted: AtomicU64,
    pub submit_rejected: AtomicU64,
    pub backpressure_drops: AtomicU64,
    pub transformer_drops: AtomicU64,
    pub unrouted: AtomicU64,
}

/// Per-sink counters.
#[derive(Debug, Default)]
struct LaneStats {
    routed: AtomicU64,
    outbox_drops: AtomicU64,
    batches: AtomicU64,
    written: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    permanent_loss: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time view of one sink's delivery state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub routed: u64,
    pub outbox_depth: usize,
    pub outbox_drops: u64,
    pub batches: u64,
    pub written: u64,
    pub errors: u64,
    pub retries: u64,
    pub permanent_loss: u64,
    pub dead_lettered: u64,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    pub ingress_depth: usize,
    pub submit_accepted: u64,
    pub submit_rejected: u64,
    pub backpressure_drops: u64,
    pub transformer_drops: u64,
    pub unrouted: u64,
    pub sinks: BTreeMap<String, SinkSnapshot>,
}

/// Shared ingress queue: the only entry point into the engine.
struct Ingress {
    name: String,
    capacity: usize,
    policy: BackpressurePolicy,
    submit_timeout: Duration,
    queue: Mutex<VecDeque<FlowMessage>>,
    space: Notify,
    data: Notify,
    accepting: AtomicBool,
    stats: FlowStats,
}

impl Ingress {
    fn new(config: &FlowConfig) -> Self {
        Self {
            name: config.name.clone(),
            capacity: config.ingress_capacity,
            policy: config.backpressure,
            submit_timeout: config.submit_timeout,
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            data: Notify::new(),
            accepting: AtomicBool::new(true),
            stats: FlowStats::default(),
        }
    }

    async fn submit(&self, data: MarketData) -> EnqueueResult {
        if !self.accepting.load(Ordering::Acquire) {
            self.stats.submit_rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueResult::Rejected(RejectReason::Stopped);
        }

        let msg = FlowMessage::new(data);
        let deadline = Instant::now() + self.submit_timeout;
        let mut msg = Some(msg);

        loop {
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(msg.take().expect("msg present until enqueued"));
                    drop(queue);
                    self.accept();
                    return EnqueueResult::Accepted;
                }
                match self.policy {
                    BackpressurePolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(msg.take().expect("msg present until enqueued"));
                        drop(queue);
                        self.stats.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                        metrics::FLOW_BACKPRESSURE_DROPS
                            .with_label_values(&[&self.name])
                            .inc();
                        self.accept();
                        return EnqueueResult::Accepted;
                    }
                    BackpressurePolicy::DropNew => {
                        drop(queue);
                        return self.reject();
                    }
                    BackpressurePolicy::Block => {}
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return self.reject();
            }
            let _ = tokio::time::timeout(deadline - now, self.space.notified()).await;
            if !self.accepting.load(Ordering::Acquire) {
                self.stats.submit_rejected.fetch_add(1, Ordering::Relaxed);
                return EnqueueResult::Rejected(RejectReason::Stopped);
            }
        }
    }

    fn accept(&self) {
        self.data.notify_one();
        self.stats.submit_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::FLOW_SUBMIT_TOTAL
            .with_label_values(&[&self.name, "accepted"])
            .inc();
    }

    fn reject(&self) -> EnqueueResult {
        self.stats.submit_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::FLOW_SUBMIT_TOTAL
            .with_label_values(&[&self.name, "rejected"])
            .inc();
        EnqueueResult::Rejected(RejectReason::Backpressure)
    }

    fn pop_up_to(&self, max: usize) -> Vec<FlowMessage> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        let drained: Vec<FlowMessage> = queue.drain(..n).collect();
        drop(queue);
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }

    fn depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
        self.space.notify_waiters();
    }
}

/// One registered sink with its outbox and counters.
struct SinkLane {
    sink: Arc<dyn Sink>,
    outbox: Outbox,
    policy: OutboxPolicy,
    batch_size: usize,
    batch_timeout: Duration,
    stats: LaneStats,
}

impl SinkLane {
    fn id(&self) -> &str {
        self.sink.id()
    }

    fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            routed: self.stats.routed.load(Ordering::Relaxed),
            outbox_depth: self.outbox.len(),
            outbox_drops: self.stats.outbox_drops.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            permanent_loss: self.stats.permanent_loss.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct FlowHandle {
    ingress: Arc<Ingress>,
    lanes: Vec<Arc<SinkLane>>,
    stop: CancellationToken,
    force: CancellationToken,
}

impl FlowHandle {
    /// Submit one record. Never blocks longer than `submit_timeout`.
    pub async fn submit(&self, data: MarketData) -> EnqueueResult {
        self.ingress.submit(data).await
    }

    /// Graceful stop on the first call; a second call within the drain
    /// window escalates to a forced close.
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            warn!("Second stop: forcing close");
            self.force.cancel();
        } else {
            self.stop.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Counters and queue depths.
    pub fn snapshot(&self) -> FlowSnapshot {
        let stats = &self.ingress.stats;
        FlowSnapshot {
            ingress_depth: self.ingress.depth(),
            submit_accepted: stats.submit_accepted.load(Ordering::Relaxed),
            submit_rejected: stats.submit_rejected.load(Ordering::Relaxed),
            backpressure_drops: stats.backpressure_drops.load(Ordering::Relaxed),
            transformer_drops: stats.transformer_drops.load(Ordering::Relaxed),
            unrouted: stats.unrouted.load(Ordering::Relaxed),
            sinks: self
                .lanes
                .iter()
                .map(|lane| (lane.id().to_string(), lane.snapshot()))
                .collect(),
        }
    }

    /// Per-sink health reports.
    pub fn sink_health(&self) -> BTreeMap<String, SinkHealth> {
        self.lanes
            .iter()
            .map(|lane| (lane.id().to_string(), lane.sink.health()))
            .collect()
    }
}

/// Worker-side retry parameters.
#[derive(Clone)]
struct WorkerConfig {
    engine: String,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

/// The dataflow engine. Configure, take a handle, then `run`.
pub struct DataFlowEngine {
    config: FlowConfig,
    ingress: Arc<Ingress>,
    transformers: Vec<Arc<dyn Transformer>>,
    transformer_index: HashMap<String, usize>,
    router: Router,
    lanes: Vec<Arc<SinkLane>>,
    lane_index: HashMap<String, usize>,
    dead_letter: Option<Arc<dyn DeadLetter>>,
    /// Stall buffers for Block-policy lanes, keyed by sink id.
    stalled: HashMap<String, VecDeque<FlowMessage>>,
    stop: CancellationToken,
    force: CancellationToken,
}

impl DataFlowEngine {
    pub fn new(config: FlowConfig) -> Self {
        let ingress = Arc::new(Ingress::new(&config));
        Self {
            config,
            ingress,
            transformers: Vec::new(),
            transformer_index: HashMap::new(),
            router: Router::default(),
            lanes: Vec::new(),
            lane_index: HashMap::new(),
            dead_letter: None,
            stalled: HashMap::new(),
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    pub fn add_transformer(&mut self, transformer: Arc<dyn Transformer>) {
        self.transformer_index
            .insert(transformer.id().to_string(), self.transformers.len());
        self.transformers.push(transformer);
    }

    pub fn set_router(&mut self, router: Router) {
        self.router = router;
    }

    pub fn set_dead_letter(&mut self, dead_letter: Arc<dyn DeadLetter>) {
        self.dead_letter = Some(dead_letter);
    }

    /// Register a sink with engine-default options.
    pub fn register_sink(&mut self, sink: Arc<dyn Sink>) {
        self.register_sink_with(sink, SinkOptions::default());
    }

    /// Register a sink with per-sink overrides.
    pub fn register_sink_with(&mut self, sink: Arc<dyn Sink>, options: SinkOptions) {
        let id = sink.id().to_string();
        let lane = Arc::new(SinkLane {
            outbox: Outbox::new(options.outbox_capacity.unwrap_or(self.config.outbox_capacity)),
            policy: options.policy,
            batch_size: options.batch_size.unwrap_or(self.config.batch_size),
            batch_timeout: options.batch_timeout.unwrap_or(self.config.batch_timeout),
            stats: LaneStats::default(),
            sink,
        });
        if options.policy == OutboxPolicy::Block {
            self.stalled.insert(id.clone(), VecDeque::new());
        }
        self.lane_index.insert(id, self.lanes.len());
        self.lanes.push(lane);
    }

    /// Handle for submit/stop/stats. Take it after registering sinks.
    pub fn handle(&self) -> FlowHandle {
        FlowHandle {
            ingress: Arc::clone(&self.ingress),
            lanes: self.lanes.clone(),
            stop: self.stop.clone(),
            force: self.force.clone(),
        }
    }

    /// Run the engine until stopped. Spawns one worker per sink; the engine
    /// loop itself stays single-threaded.
    pub async fn run(mut self) {
        info!(
            engine = %self.config.name,
            sinks = self.lanes.len(),
            transformers = self.transformers.len(),
            "DataFlow engine starting"
        );

        let worker_config = WorkerConfig {
            engine: self.config.name.clone(),
            max_retries: self.config.sink_max_retries,
            base_delay: self.config.sink_base_delay,
            max_delay: self.config.sink_max_delay,
        };
        let write_permits = Arc::new(Semaphore::new(self.config.sink_parallelism.max(1)));
        let mut workers = Vec::new();
        for lane in &self.lanes {
            workers.push(tokio::spawn(sink_worker(
                Arc::clone(lane),
                worker_config.clone(),
                self.dead_letter.clone(),
                Arc::clone(&write_permits),
                self.force.clone(),
            )));
        }

        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let did_work = self.tick().await;
            if !did_work {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = self.ingress.data.notified() => {}
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                }
            }
        }

        self.shutdown(workers).await;
    }

    /// One scheduler pass: flush stall buffers, then pull and process a
    /// bounded slice of ingress. Returns whether anything happened.
    async fn tick(&mut self) -> bool {
        let did_work = self.flush_stalled();

        // A Block-policy sink with a full stall buffer pauses ingress
        // processing (bounded memory); wait briefly for outbox space.
        if let Some(sink_id) = self.full_stall_lane() {
            let lane = &self.lanes[self.lane_index[&sink_id]];
            let _ = tokio::time::timeout(STALL_WAIT, lane.outbox.space.notified()).await;
            return true;
        }

        let batch = self.ingress.pop_up_to(self.config.tick_batch);
        metrics::FLOW_INGRESS_DEPTH
            .with_label_values(&[&self.config.name])
            .set(self.ingress.depth() as i64);
        if batch.is_empty() {
            return did_work;
        }
        for msg in batch {
            self.process(msg);
        }
        true
    }

    fn full_stall_lane(&self) -> Option<String> {
        self.stalled
            .iter()
            .find(|(_, queue)| queue.len() >= self.config.tick_batch)
            .map(|(id, _)| id.clone())
    }

    /// Transformer chain, routing and fan-out for one message.
    fn process(&mut self, mut msg: FlowMessage) {
        let mut data = msg.data;
        for transformer in &self.transformers {
            match transformer.transform(data) {
                Some(out) => data = out,
                None => {
                    self.count_transformer_drop(transformer.id());
                    return;
                }
            }
        }

        let decision = self.router.route(&data);
        if decision.is_empty() {
            self.ingress.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            metrics::FLOW_UNROUTED
                .with_label_values(&[&self.config.name])
                .inc();
            return;
        }

        for id in &decision.transformer_ids {
            let Some(&index) = self.transformer_index.get(id) else {
                warn!(engine = %self.config.name, transformer = %id, "Unknown transformer in route rule");
                continue;
            };
            match self.transformers[index].transform(data) {
                Some(out) => data = out,
                None => {
                    self.count_transformer_drop(id);
                    return;
                }
            }
        }

        msg.data = data;
        for target in &decision.targets {
            let Some(&index) = self.lane_index.get(target) else {
                warn!(engine = %self.config.name, sink = %target, "Route targets unknown sink");
                continue;
            };
            let lane = Arc::clone(&self.lanes[index]);
            self.deliver(&lane, msg.clone());
        }
    }

    fn count_transformer_drop(&self, id: &str) {
        self.ingress
            .stats
            .transformer_drops
            .fetch_add(1, Ordering::Relaxed);
        metrics::FLOW_TRANSFORMER_DROPS
            .with_label_values(&[&self.config.name, id])
            .inc();
    }

    /// Enqueue one copy into a sink's outbox, honoring its full-queue
    /// policy. FIFO per sink: once a Block lane has stalled messages, new
    /// ones append behind them.
    fn deliver(&mut self, lane: &Arc<SinkLane>, msg: FlowMessage) {
        if let Some(stall) = self.stalled.get_mut(lane.id()) {
            if !stall.is_empty() {
                stall.push_back(msg);
                return;
            }
        }
        match lane.outbox.push(msg) {
            Ok(()) => {
                lane.stats.routed.fetch_add(1, Ordering::Relaxed);
                metrics::FLOW_ROUTED_TO
                    .with_label_values(&[&self.config.name, lane.id()])
                    .inc();
                metrics::FLOW_OUTBOX_DEPTH
                    .with_label_values(&[&self.config.name, lane.id()])
                    .set(lane.outbox.len() as i64);
            }
            Err(msg) => match lane.policy {
                OutboxPolicy::Drop => {
                    lane.stats.outbox_drops.fetch_add(1, Ordering::Relaxed);
                    debug!(engine = %self.config.name, sink = %lane.id(), "Outbox full, copy dropped");
                }
                OutboxPolicy::Block => {
                    self.stalled
                        .get_mut(lane.id())
                        .expect("stall buffer exists for Block lanes")
                        .push_back(msg);
                }
            },
        }
    }

    /// Move stalled messages into their outboxes as space appears.
    fn flush_stalled(&mut self) -> bool {
        let mut did_work = false;
        for (sink_id, queue) in self.stalled.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let lane = &self.lanes[self.lane_index[sink_id]];
            while let Some(msg) = queue.pop_front() {
                match lane.outbox.push(msg) {
                    Ok(()) => {
                        lane.stats.routed.fetch_add(1, Ordering::Relaxed);
                        metrics::FLOW_ROUTED_TO
                            .with_label_values(&[&self.config.name, sink_id])
                            .inc();
                        did_work = true;
                    }
                    Err(msg) => {
                        queue.push_front(msg);
                        break;
                    }
                }
            }
        }
        did_work
    }

    /// Graceful drain: refuse new submits, run the remaining ingress
    /// through the pipeline, flush outboxes, close sinks in registration
    /// order. A force cancel abandons the drain and counts outbox contents
    /// as permanent loss (the workers do the accounting).
    async fn shutdown(&mut self, workers: Vec<JoinHandle<()>>) {
        info!(engine = %self.config.name, "Draining");
        self.ingress.stop_accepting();

        let deadline = Instant::now() + self.config.drain_timeout;
        while (self.ingress.depth() > 0 || self.stalled.values().any(|q| !q.is_empty()))
            && Instant::now() < deadline
            && !self.force.is_cancelled()
        {
            if !self.tick().await {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        let undrained: usize = self.ingress.depth()
            + self.stalled.values().map(VecDeque::len).sum::<usize>();
        if undrained > 0 {
            warn!(engine = %self.config.name, undrained, "Drain incomplete");
        }

        for lane in &self.lanes {
            lane.outbox.close();
        }

        for worker in workers {
            let joined =
                tokio::time::timeout(self.config.sink_drain_timeout, worker).await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(engine = %self.config.name, ?e, "Sink worker panicked"),
                Err(_) => {
                    warn!(engine = %self.config.name, "Sink worker drain timeout, forcing");
                    self.force.cancel();
                }
            }
        }

        // Close sinks in registration order.
        for lane in &self.lanes {
            if let Err(e) = lane.sink.close().await {
                warn!(engine = %self.config.name, sink = %lane.id(), ?e, "Sink close failed");
            }
        }
        info!(engine = %self.config.name, "Stopped");
    }
}

/// Serial worker for one sink: forms batches and writes them with retry.
/// Writes across all workers share the engine's parallelism semaphore.
async fn sink_worker(
    lane: Arc<SinkLane>,
    config: WorkerConfig,
    dead_letter: Option<Arc<dyn DeadLetter>>,
    write_permits: Arc<Semaphore>,
    force: CancellationToken,
) {
    let mut batch: Vec<FlowMessage> = Vec::with_capacity(lane.batch_size);
    let mut batch_opened_at: Option<Instant> = None;

    loop {
        if force.is_cancelled() {
            let abandoned = lane.outbox.drain_all().len() + batch.len();
            if abandoned > 0 {
                lane.stats
                    .permanent_loss
                    .fetch_add(abandoned as u64, Ordering::Relaxed);
                metrics::FLOW_SINK_PERMANENT_LOSS
                    .with_label_values(&[&config.engine, lane.id()])
                    .inc_by(abandoned as f64);
                warn!(sink = %lane.id(), abandoned, "Forced close, outbox abandoned");
            }
            return;
        }

        let popped = lane.outbox.pop_up_to(lane.batch_size - batch.len());
        if !popped.is_empty() {
            if batch.is_empty() {
                batch_opened_at = Some(Instant::now());
            }
            batch.extend(popped);
            metrics::FLOW_OUTBOX_DEPTH
                .with_label_values(&[&config.engine, lane.id()])
                .set(lane.outbox.len() as i64);
        }

        let deadline_hit = batch_opened_at
            .map(|t| t.elapsed() >= lane.batch_timeout)
            .unwrap_or(false);
        let draining = lane.outbox.is_closed() && lane.outbox.is_empty();

        if !batch.is_empty() && (batch.len() >= lane.batch_size || deadline_hit || draining) {
            // The loop top handles force accounting for the held batch.
            let permit = tokio::select! {
                _ = force.cancelled() => continue,
                permit = write_permits.acquire() => {
                    permit.expect("write semaphore never closed")
                }
            };
            write_batch(&lane, &config, &dead_letter, &force, &mut batch).await;
            drop(permit);
            batch.clear();
            batch_opened_at = None;
            continue;
        }

        if draining && batch.is_empty() {
            return;
        }

        let wait = match batch_opened_at {
            Some(t) => lane
                .batch_timeout
                .saturating_sub(t.elapsed())
                .max(Duration::from_millis(1)),
            None => IDLE_WAIT,
        };
        tokio::select! {
            _ = force.cancelled() => {}
            _ = lane.outbox.data.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Write one batch with transient-error retry and dead-letter fallout.
async fn write_batch(
    lane: &Arc<SinkLane>,
    config: &WorkerConfig,
    dead_letter: &Option<Arc<dyn DeadLetter>>,
    force: &CancellationToken,
    batch: &mut [FlowMessage],
) {
    let records: Vec<MarketData> = batch.iter().map(|m| m.data.clone()).collect();
    let mut attempt = 0u32;

    loop {
        let result = tokio::select! {
            _ = force.cancelled() => {
                lane.stats
                    .permanent_loss
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                metrics::FLOW_SINK_PERMANENT_LOSS
                    .with_label_values(&[&config.engine, lane.id()])
                    .inc_by(records.len() as f64);
                return;
            }
            result = lane.sink.write(&records) => result,
        };
        match result {
            Ok(()) => {
                lane.stats.batches.fetch_add(1, Ordering::Relaxed);
                lane.stats
                    .written
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                metrics::FLOW_SINK_BATCHES
                    .with_label_values(&[&config.engine, lane.id()])
                    .inc();
                if let Ok(bytes) = serde_json::to_vec(&records) {
                    metrics::FLOW_SINK_BYTES
                        .with_label_values(&[&config.engine, lane.id()])
                        .inc_by(bytes.len() as f64);
                }
                for msg in batch.iter() {
                    metrics::FLOW_E2E_LATENCY_MS
                        .with_label_values(&[&config.engine, lane.id()])
                        .observe(msg.enqueued_at.elapsed().as_secs_f64() * 1000.0);
                }
                return;
            }
            Err(e) => {
                lane.stats.errors.fetch_add(1, Ordering::Relaxed);
                metrics::FLOW_SINK_ERRORS
                    .with_label_values(&[&config.engine, lane.id()])
                    .inc();

                if e.is_transient() && attempt < config.max_retries {
                    attempt += 1;
                    for msg in batch.iter_mut() {
                        msg.attempts += 1;
                    }
                    lane.stats.retries.fetch_add(1, Ordering::Relaxed);
                    metrics::FLOW_SINK_RETRIES
                        .with_label_values(&[&config.engine, lane.id()])
                        .inc();
                    let delay_ms = (config.base_delay.as_millis() as u64)
                        .saturating_mul(1u64 << attempt.min(16))
                        .min(config.max_delay.as_millis() as u64);
                    debug!(
                        sink = %lane.id(),
                        attempt,
                        delay_ms,
                        error = %e,
                        "Retrying sink write"
                    );
                    tokio::select! {
                        _ = force.cancelled() => {
                            lane.stats
                                .permanent_loss
                                .fetch_add(records.len() as u64, Ordering::Relaxed);
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                    continue;
                }

                // Permanent failure or retry budget exhausted.
                if let Some(dlq) = dead_letter {
                    warn!(sink = %lane.id(), error = %e, count = records.len(), "Batch dead-lettered");
                    dlq.dead_letter(records, &e.to_string());
                    lane.stats
                        .dead_lettered
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                } else {
                    error!(sink = %lane.id(), error = %e, count = records.len(), "Batch lost");
                    lane.stats
                        .permanent_loss
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    metrics::FLOW_SINK_PERMANENT_LOSS
                        .with_label_values(&[&config.engine, lane.id()])
                        .inc_by(batch.len() as f64);
                }
                return;
            }
        }
    }
}
