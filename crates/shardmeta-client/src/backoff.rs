//! Randomized exponential backoff for connection attempts.

use shardmeta_common::{BackoffConfig, Error};
use std::time::Duration;
use tracing::{error, info, warn};

/// Backoff state for one connection; never gives up.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures since the last reset
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Longest delay this policy will produce
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.config.max_delay_ms.max(self.config.initial_delay_ms))
    }

    /// Forget past failures
    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and return how long to wait before the next attempt.
    ///
    /// The undisturbed delay doubles from `initial_delay_ms` up to
    /// `max_delay_ms`; jitter stretches it by up to `randomisation_factor`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Duration {
        use rand::Rng;

        let max = self.config.max_delay_ms.max(self.config.initial_delay_ms);
        let shift = self.failures.min(32);
        let base = self
            .config
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(max);
        self.failures = self.failures.saturating_add(1);

        let factor = self.config.randomisation_factor.clamp(0.0, 1.0);
        let jitter = if factor > 0.0 {
            (base as f64 * rand::thread_rng().gen_range(0.0..=factor)) as u64
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(max))
    }
}

/// Log a failed connection attempt, louder as failures pile up.
pub fn log_attempt_failure(shard: &str, attempt: u32, retry_in: Duration, err: &Error) {
    let retry_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX);
    match attempt {
        0 | 1 => info!(shard, attempt, retry_ms, error = %err, "shard init attempt failed (will retry)"),
        2..=5 => warn!(shard, attempt, retry_ms, error = %err, "shard init attempt failed (will retry)"),
        _ => error!(shard, attempt, retry_ms, error = %err, "shard init attempt failed (will retry)"),
    }
}
