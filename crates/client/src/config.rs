//! Configuration for the client core.
//!
//! Every timing constant the components use is supplied here rather than
//! hard-coded; defaults are sensible but nothing depends on them.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay (before jitter).
    pub cap: Duration,
    /// Maximum random jitter added on top of the computed delay.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffConfig {
    /// Deterministic part of the delay for the given attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Full delay for the given attempt, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }
}

/// Tunables for all four core components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Window within which repeated triggers of the same operation kind are
    /// collapsed into the first one.
    pub debounce_window: Duration,
    /// Reconnect backoff schedule.
    pub backoff: BackoffConfig,
    /// Cap on automatic reconnect attempts; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// How often a ping is sent while the connection is open.
    pub heartbeat_interval: Duration,
    /// Idle window after which the connection is considered silently dead.
    pub heartbeat_timeout: Duration,
    /// How long an optimistic message may stay pending before it is failed
    /// with a timeout.
    pub confirmation_timeout: Duration,
    /// Maximum number of messages held while disconnected; sends beyond this
    /// are rejected with `QueueFull`.
    pub outbound_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(300),
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: None,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(20),
            outbound_queue_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(8),
            jitter: Duration::ZERO,
        };

        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(4));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(8));
        // Capped from here on
        assert_eq!(backoff.base_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let backoff = BackoffConfig {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
        };

        for _ in 0..50 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
