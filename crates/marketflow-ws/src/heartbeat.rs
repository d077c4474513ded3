//! Heartbeat compliance for exchange WebSocket connections.
//!
//! Binance drives the cadence: the server pings roughly every 20 seconds
//! and expects a pong carrying the identical payload within 5 seconds. The
//! controller tracks that timing and condenses it into a health score.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::Duration;

/// EWMA smoothing factor for the health score.
const SCORE_ALPHA: f64 = 0.2;
/// Number of ping inter-arrival intervals kept for drift detection.
const INTERVAL_WINDOW: usize = 10;
/// Relative drift of the mean ping interval that triggers a score penalty.
const DRIFT_TOLERANCE: f64 = 0.2;
/// Score multiplier applied while the ping cadence is drifting.
const DRIFT_PENALTY: f64 = 0.7;

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How quickly a pong must follow a server ping.
    pub pong_response_timeout: Duration,
    /// Silence threshold: no server ping within this window means the
    /// connection is considered dead.
    pub ping_timeout_threshold: Duration,
    /// Expected server ping cadence, used for drift detection.
    pub expected_ping_interval: Duration,
    /// Whether the client may originate pings. Binance forbids it.
    pub allow_unsolicited_ping: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_response_timeout: Duration::from_secs(5),
            ping_timeout_threshold: Duration::from_secs(60),
            expected_ping_interval: Duration::from_secs(20),
            allow_unsolicited_ping: false,
        }
    }
}

#[derive(Debug)]
struct HeartbeatState {
    last_ping_received: Option<DateTime<Utc>>,
    last_pong_sent: Option<DateTime<Utc>>,
    /// EWMA of per-pair raw scores; None until the first ping/pong pair.
    score_ewma: Option<f64>,
    /// Ping inter-arrival intervals in milliseconds.
    intervals: VecDeque<i64>,
    /// Epoch for silence measurement before the first ping arrives.
    reset_at: DateTime<Utc>,
}

/// Tracks ping/pong timing and computes the connection health score.
pub struct HeartbeatController {
    config: HeartbeatConfig,
    state: RwLock<HeartbeatState>,
}

impl HeartbeatController {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HeartbeatState {
                last_ping_received: None,
                last_pong_sent: None,
                score_ewma: None,
                intervals: VecDeque::with_capacity(INTERVAL_WINDOW),
                reset_at: Utc::now(),
            }),
        }
    }

    /// Reset timing state (called when a connection is (re)established).
    pub fn reset(&self) {
        self.reset_at(Utc::now());
    }

    pub fn reset_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.last_ping_received = None;
        state.last_pong_sent = None;
        state.score_ewma = None;
        state.intervals.clear();
        state.reset_at = now;
    }

    /// Record a server ping arrival.
    pub fn record_ping_received(&self) {
        self.record_ping_received_at(Utc::now());
    }

    pub fn record_ping_received_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        if let Some(prev) = state.last_ping_received {
            let interval_ms = (now - prev).num_milliseconds();
            if state.intervals.len() == INTERVAL_WINDOW {
                state.intervals.pop_front();
            }
            state.intervals.push_back(interval_ms);
        }
        state.last_ping_received = Some(now);
    }

    /// Record the pong reply for the most recent ping and fold its latency
    /// into the score.
    pub fn record_pong_sent(&self) {
        self.record_pong_sent_at(Utc::now());
    }

    pub fn record_pong_sent_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.last_pong_sent = Some(now);

        let Some(ping_at) = state.last_ping_received else {
            return;
        };
        let latency_ms = (now - ping_at).num_milliseconds().max(0) as f64;
        let timeout_ms = self.config.pong_response_timeout.as_millis() as f64;
        let raw = 1.0 - (latency_ms / timeout_ms).min(1.0);

        state.score_ewma = Some(match state.score_ewma {
            Some(prev) => SCORE_ALPHA * raw + (1.0 - SCORE_ALPHA) * prev,
            None => raw,
        });
    }

    /// Current health score in [0, 1].
    ///
    /// EWMA of per-pair latency scores, multiplied by a penalty when the
    /// observed mean ping interval drifts more than 20% from the expected
    /// cadence.
    pub fn score(&self) -> f64 {
        let state = self.state.read();
        let base = state.score_ewma.unwrap_or(1.0);

        if state.intervals.is_empty() {
            return base;
        }
        let mean_ms =
            state.intervals.iter().sum::<i64>() as f64 / state.intervals.len() as f64;
        let expected_ms = self.config.expected_ping_interval.as_millis() as f64;
        let drift = ((mean_ms - expected_ms) / expected_ms).abs();

        if drift > DRIFT_TOLERANCE {
            (base * DRIFT_PENALTY).clamp(0.0, 1.0)
        } else {
            base.clamp(0.0, 1.0)
        }
    }

    /// Whether the server has been silent past the ping timeout threshold.
    pub fn is_silent(&self) -> bool {
        self.is_silent_at(Utc::now())
    }

    pub fn is_silent_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read();
        let last = state.last_ping_received.unwrap_or(state.reset_at);
        let threshold = ChronoDuration::from_std(self.config.ping_timeout_threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        now - last > threshold
    }

    /// Whether the client should originate a ping. Always false unless
    /// `allow_unsolicited_ping` is set.
    pub fn should_send_ping(&self) -> bool {
        self.should_send_ping_at(Utc::now())
    }

    pub fn should_send_ping_at(&self, now: DateTime<Utc>) -> bool {
        if !self.config.allow_unsolicited_ping {
            return false;
        }
        let state = self.state.read();
        let last = state.last_ping_received.unwrap_or(state.reset_at);
        let interval = ChronoDuration::from_std(self.config.expected_ping_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(20));
        now - last >= interval
    }

    /// Snapshot of the timing state.
    pub fn stats(&self) -> HeartbeatStats {
        let state = self.state.read();
        HeartbeatStats {
            last_ping_received: state.last_ping_received,
            last_pong_sent: state.last_pong_sent,
            score: self.score(),
            observed_intervals: state.intervals.len(),
        }
    }
}

/// Heartbeat timing snapshot.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_ping_received: Option<DateTime<Utc>>,
    pub last_pong_sent: Option<DateTime<Utc>>,
    pub score: f64,
    pub observed_intervals: usize,
}
