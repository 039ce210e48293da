//! Per-provider rate limiting
//!
//! Each provider gets a token bucket over two horizons: per-minute and
//! per-hour. A call must clear both; whichever bucket is empty drives
//! the `retry_after` hint. Buckets are created lazily per provider and
//! shared across all callers.

use crate::config::RateLimits;
use crate::error::{ProviderError, ProviderResult};
use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for the direct limiter to reduce complexity
type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ProviderBuckets {
    minute: DirectLimiter,
    hour: DirectLimiter,
}

/// Rate limiter keyed by provider id
pub struct ProviderRateLimiter {
    buckets: DashMap<String, Arc<ProviderBuckets>>,
    clock: DefaultClock,
}

impl Default for ProviderRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            clock: DefaultClock::default(),
        }
    }

    fn buckets_for(&self, provider_id: &str, limits: RateLimits) -> Arc<ProviderBuckets> {
        self.buckets
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                let per_minute = NonZeroU32::new(limits.per_minute.max(1))
                    .expect("clamped to at least 1");
                let per_hour =
                    NonZeroU32::new(limits.per_hour.max(1)).expect("clamped to at least 1");
                Arc::new(ProviderBuckets {
                    minute: GovernorRateLimiter::direct(Quota::per_minute(per_minute)),
                    hour: GovernorRateLimiter::direct(Quota::per_hour(per_hour)),
                })
            })
            .clone()
    }

    /// Take one token from both horizons, or report how long to wait
    ///
    /// The hour bucket is charged first; a minute-level rejection leaves
    /// that hour token spent, which under-admits rather than over-admits.
    pub fn check(&self, provider_id: &str, limits: RateLimits) -> ProviderResult<()> {
        let buckets = self.buckets_for(provider_id, limits);
        let now = self.clock.now();

        if let Err(not_until) = buckets.hour.check() {
            let retry_after = not_until.wait_time_from(now);
            metrics::counter!("provider_rate_limit_hits_total", "horizon" => "hour").increment(1);
            tracing::warn!(
                provider_id = provider_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Hourly rate limit exceeded"
            );
            return Err(ProviderError::RateLimited { retry_after });
        }

        if let Err(not_until) = buckets.minute.check() {
            let retry_after = not_until.wait_time_from(now);
            metrics::counter!("provider_rate_limit_hits_total", "horizon" => "minute")
                .increment(1);
            tracing::warn!(
                provider_id = provider_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Per-minute rate limit exceeded"
            );
            return Err(ProviderError::RateLimited { retry_after });
        }

        Ok(())
    }

    /// Remove a provider's buckets (after deregistration)
    pub fn forget(&self, provider_id: &str) {
        self.buckets.remove(provider_id);
    }
}

/// Round a retry-after duration up to whole milliseconds for reporting
pub fn retry_after_ms(retry_after: Duration) -> u64 {
    let ms = retry_after.as_millis() as u64;
    if ms == 0 && !retry_after.is_zero() {
        1
    } else {
        ms
    }
}
