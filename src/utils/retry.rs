// file: src/utils/retry.rs
// description: exponential backoff shared by the download and upload adapters
// reference: retry-with-backoff over classified errors

use crate::config::PipelineConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on every further failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the budget is spent. `attempt` is the caller's counter and is bumped
/// before every try, so it ends at the number of attempts made.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    attempt: &mut u32,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        *attempt += 1;

        match operation(*attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.has_attempts_left(*attempt) => {
                let delay = policy.delay_for_attempt(*attempt);
                warn!(
                    attempt = *attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying {} after transient error",
                    label
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
