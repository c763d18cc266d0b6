//! Bounded exponential backoff
//!
//! Every recovery category and every download stage owns a counter. Entering
//! the category increments the counter and sleeps `base * 2^(n-1)` before
//! the attempt; a counter past `max_attempts` ends the cycle.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use lockstep_core::config::RecoveryConfig;
use lockstep_core::ports::ApiError;

/// Longest single backoff sleep
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Retry budget and delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `attempt`-th try (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    /// True once `attempt` is past the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Sleeps the delay for `attempt`
    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Runs `f` until it succeeds, retrying network and transient failures
///
/// Other errors are returned immediately. After `max_attempts` tries the
/// last error is returned.
pub async fn with_retry<F, Fut, T>(backoff: &Backoff, operation: &str, f: F) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if (err.is_transient() || err.is_network()) && attempt < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
