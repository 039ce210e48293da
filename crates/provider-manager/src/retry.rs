//! Retry execution for provider calls
//!
//! Supports the four configured strategies. Only retriable errors are
//! retried; client errors and rate limits propagate immediately.

use crate::config::{RetryPolicy, RetryStrategy};
use crate::error::ProviderResult;
use rand::Rng;
use std::time::Duration;

impl RetryPolicy {
    /// Calculate the delay before the given attempt (1-indexed)
    ///
    /// - `none`: no delay (and no retries)
    /// - `fixed`: base_delay
    /// - `linear`: base_delay * attempt
    /// - `exponential`: base_delay * 2^(attempt-1)
    ///
    /// Capped at `max_delay`; jitter then scales by 0.5..1.5.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            RetryStrategy::Exponential => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(multiplier)
            }
        };
        let capped = std::cmp::min(raw, self.max_delay);

        if self.jitter && !capped.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }

    /// Whether another attempt is permitted after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt < self.max_attempts
    }
}

/// Execute a provider operation under a retry policy
///
/// `provider_id` labels metrics and logs. The last error is returned
/// once attempts are exhausted or a non-retriable error occurs.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    provider_id: &str,
    mut operation: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if e.is_retryable() && policy.should_retry(attempt) {
                    let delay = policy.delay_for_attempt(attempt);

                    tracing::warn!(
                        provider_id = provider_id,
                        attempt = attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying provider call after error"
                    );

                    metrics::counter!("provider_retries_total", "provider" => provider_id.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                } else {
                    if !e.is_retryable() {
                        tracing::debug!(
                            provider_id = provider_id,
                            error = %e,
                            "Provider error is not retryable, failing immediately"
                        );
                    } else {
                        tracing::warn!(
                            provider_id = provider_id,
                            attempt = attempt,
                            max_attempts = policy.max_attempts,
                            error = %e,
                            "Provider retries exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
