//! Upstream reconnection policy
//!
//! The default policy retries forever with a fixed one second pause. A
//! multiplier above 1.0 turns it into exponential backoff capped at `max_delay`.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per failed attempt (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Add ±25% random jitter to each delay
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial_delay,
            max_delay: Duration::from_millis(config.max_delay_ms).max(initial_delay),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    /// Connection attempts made by the helper
    pub total_attempts: u64,
    /// Attempts that produced a connection
    pub successful_reconnects: u64,
    /// Attempts that failed
    pub failed_reconnects: u64,
}

/// Retry-until-connected helper with backoff and statistics
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    /// Consecutive failures since the last success
    failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Delay to wait before the next attempt
    ///
    /// Never exceeds `max_delay`, however many attempts have failed.
    pub fn next_delay(&self) -> Duration {
        let max_delay = self.policy.max_delay;
        let multiplier = self.policy.backoff_multiplier.max(1.0);

        // delay = initial_delay * (multiplier ^ failures), capped before it is
        // converted back to a Duration
        let exponent = self.failures.min(1024) as i32;
        let growth = multiplier.powi(exponent);
        let secs = if growth.is_finite() {
            (self.policy.initial_delay.as_secs_f64() * growth).min(max_delay.as_secs_f64())
        } else {
            max_delay.as_secs_f64()
        };
        let mut delay = Duration::try_from_secs_f64(secs).unwrap_or(max_delay);

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    /// Sleep the backoff delay, then call `connect_fn` until it succeeds
    ///
    /// Never gives up: only returns once a connection is established.
    pub async fn reconnect<F, Fut, T, E>(&mut self, mut connect_fn: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            let delay = self.next_delay();
            debug!("Waiting {:?} before reconnection attempt", delay);
            tokio::time::sleep(delay).await;

            self.stats.total_attempts += 1;
            let start_time = Instant::now();

            match connect_fn().await {
                Ok(conn) => {
                    self.stats.successful_reconnects += 1;
                    info!(
                        "Reconnected in {:?} after {} failed attempt(s); {} attempts, {} failed overall",
                        start_time.elapsed(),
                        self.failures,
                        self.stats.total_attempts,
                        self.stats.failed_reconnects
                    );
                    self.failures = 0;
                    return conn;
                },
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    self.stats.failed_reconnects += 1;
                    warn!("Reconnection attempt {} failed: {}", self.failures, e);
                },
            }
        }
    }
}
