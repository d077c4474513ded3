//! Reconnection policy.
//!
//! Decides whether and when to redial after a disconnect: exponential
//! backoff with uniform jitter, a decision table keyed by the error kind,
//! and escalation once consecutive attempts exhaust the retry budget.

use rand::Rng;
use std::time::Duration;

/// Classified cause of a disconnect or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Connection,
    Network,
    Timeout,
    HeartbeatLost,
    Protocol,
    DataParsing,
    Authentication,
    Config,
}

impl DisconnectKind {
    /// Decision table: which kinds warrant a reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection
            | Self::Network
            | Self::Timeout
            | Self::HeartbeatLost
            | Self::Protocol => true,
            Self::DataParsing | Self::Authentication | Self::Config => false,
        }
    }

    /// Classify an RFC 6455 close code. 1000/1001 are normal closures
    /// (still redialed, Binance rotates connections); 1002/1003/1007/1008
    /// indicate protocol violations.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1002 | 1003 | 1007 | 1008 => Self::Protocol,
            _ => Self::Connection,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HeartbeatLost => "heartbeat_lost",
            Self::Protocol => "protocol",
            Self::DataParsing => "data_parsing",
            Self::Authentication => "authentication",
            Self::Config => "config",
        }
    }
}

/// Reconnect configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay for the first attempt.
    pub initial_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Jitter fraction: the delay is multiplied by a factor drawn uniformly
    /// from [1 - jitter, 1 + jitter].
    pub jitter: f64,
    /// Consecutive attempts without a stable period before escalating.
    pub max_retries: u32,
    /// An active period at least this long resets the attempt counter.
    pub min_stable_uptime: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            max_retries: 10,
            min_stable_uptime: Duration::from_secs(30),
        }
    }
}

/// Outcome of a reconnect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectDecision {
    pub should_reconnect: bool,
    pub delay: Duration,
}

impl ReconnectDecision {
    fn give_up() -> Self {
        Self {
            should_reconnect: false,
            delay: Duration::ZERO,
        }
    }
}

/// Stateful reconnect strategy: owns the consecutive-attempt counter.
#[derive(Debug)]
pub struct ReconnectStrategy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectStrategy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Attempts since the last stable period.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record how long the connection was active; a period of at least
    /// `min_stable_uptime` resets the attempt counter.
    pub fn record_uptime(&mut self, uptime: Duration) {
        if uptime >= self.config.min_stable_uptime {
            self.attempts = 0;
        }
    }

    /// Decide whether to reconnect after a failure of the given kind.
    ///
    /// Retryable kinds increment the attempt counter and yield a jittered
    /// exponential delay; non-retryable kinds and exhausted budgets yield
    /// `should_reconnect = false` (the caller escalates).
    pub fn decide(&mut self, kind: DisconnectKind) -> ReconnectDecision {
        if !kind.is_retryable() {
            return ReconnectDecision::give_up();
        }

        self.attempts += 1;
        if self.attempts > self.config.max_retries {
            return ReconnectDecision::give_up();
        }

        ReconnectDecision {
            should_reconnect: true,
            delay: self.jittered_delay(self.attempts),
        }
    }

    /// Base backoff for a given attempt: `initial * 2^(attempt-1)`, clamped
    /// to `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_millis((base.as_millis() as f64 * factor).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> ReconnectStrategy {
        ReconnectStrategy::new(ReconnectConfig::default())
    }

    #[test]
    fn test_decision_table() {
        for kind in [
            DisconnectKind::Connection,
            DisconnectKind::Network,
            DisconnectKind::Timeout,
            DisconnectKind::HeartbeatLost,
            DisconnectKind::Protocol,
        ] {
            assert!(kind.is_retryable(), "{kind:?} should reconnect");
        }
        for kind in [
            DisconnectKind::DataParsing,
            DisconnectKind::Authentication,
            DisconnectKind::Config,
        ] {
            assert!(!kind.is_retryable(), "{kind:?} should not reconnect");
        }
    }

    #[test]
    fn test_close_code_classification() {
        assert_eq!(
            DisconnectKind::from_close_code(1002),
            DisconnectKind::Protocol
        );
        assert_eq!(
            DisconnectKind::from_close_code(1008),
            DisconnectKind::Protocol
        );
        assert_eq!(
            DisconnectKind::from_close_code(1000),
            DisconnectKind::Connection
        );
        assert_eq!(
            DisconnectKind::from_close_code(1006),
            DisconnectKind::Connection
        );
    }

    #[test]
    fn test_backoff_bounds_with_jitter() {
        // Delays for attempts 1..=5 must lie within [0.8, 1.2] * 2^(k-1) s.
        for _ in 0..50 {
            let mut s = strategy();
            for attempt in 1u32..=5 {
                let decision = s.decide(DisconnectKind::Connection);
                assert!(decision.should_reconnect);
                let expected_base_ms = 1000u64 * (1 << (attempt - 1));
                let lo = (expected_base_ms as f64 * 0.8).floor() as u128;
                let hi = (expected_base_ms as f64 * 1.2).ceil() as u128;
                let got = decision.delay.as_millis();
                assert!(
                    (lo..=hi).contains(&got),
                    "attempt {attempt}: {got}ms outside [{lo}, {hi}]"
                );
            }
        }
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let s = ReconnectStrategy::new(ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        });
        assert_eq!(s.base_delay(7), Duration::from_secs(60));
        assert_eq!(s.base_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_non_retryable_gives_up() {
        let mut s = strategy();
        let decision = s.decide(DisconnectKind::Authentication);
        assert!(!decision.should_reconnect);
        // Attempts are not consumed by non-retryable failures.
        assert_eq!(s.attempts(), 0);
    }

    #[test]
    fn test_escalation_after_max_retries() {
        let mut s = ReconnectStrategy::new(ReconnectConfig {
            max_retries: 3,
            jitter: 0.0,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(s.decide(DisconnectKind::Network).should_reconnect);
        }
        assert!(!s.decide(DisconnectKind::Network).should_reconnect);
    }

    #[test]
    fn test_stable_uptime_resets_attempts() {
        let mut s = strategy();
        s.decide(DisconnectKind::Connection);
        s.decide(DisconnectKind::Connection);
        assert_eq!(s.attempts(), 2);

        s.record_uptime(Duration::from_secs(29));
        assert_eq!(s.attempts(), 2);

        s.record_uptime(Duration::from_secs(30));
        assert_eq!(s.attempts(), 0);
    }
}
