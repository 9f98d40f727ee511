//! In-process rate limiting and retry backoff.
//!
//! The token bucket enforces "no more than N calls per window to provider
//! P for user U". A distributed deployment would swap this for a shared
//! limiter behind the same acquire contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{LimitsConfig, RateLimitConfig};
use crate::types::{Provider, UserId};

/// One bucket's live state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-(user, provider) token buckets.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(UserId, Provider), Bucket>>,
    config: HashMap<String, RateLimitConfig>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("providers", &self.config.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build a limiter from config.
    pub fn new(limits: &LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config: limits.provider_rate_limits.clone(),
            clock,
        }
    }

    /// Wait until one call to `provider` on behalf of `user` is allowed.
    ///
    /// Providers without a configured limit are unmetered.
    pub async fn acquire(&self, user: &UserId, provider: Provider) {
        let Some(limit) = self.config.get(provider.as_str()) else {
            return;
        };
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = self.clock.monotonic();
                let bucket = buckets
                    .entry((user.clone(), provider))
                    .or_insert(Bucket {
                        tokens: f64::from(limit.capacity),
                        last_refill: now,
                    });

                // Refill based on elapsed monotonic time.
                let elapsed = now.saturating_duration_since(bucket.last_refill);
                bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * limit.refill_per_sec)
                    .min(f64::from(limit.capacity));
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else if limit.refill_per_sec > 0.0 {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / limit.refill_per_sec))
                } else {
                    // Zero refill means the bucket never recovers; treat the
                    // capacity as a hard per-process cap and park briefly so
                    // callers observe backpressure instead of spinning.
                    Some(Duration::from_millis(250))
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!(
                        user = %user,
                        provider = provider.as_str(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "rate limit reached, waiting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Non-blocking probe: take a token if one is available.
    pub async fn try_acquire(&self, user: &UserId, provider: Provider) -> bool {
        let Some(limit) = self.config.get(provider.as_str()) else {
            return true;
        };
        let mut buckets = self.buckets.lock().await;
        let now = self.clock.monotonic();
        let bucket = buckets.entry((user.clone(), provider)).or_insert(Bucket {
            tokens: f64::from(limit.capacity),
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * limit.refill_per_sec)
            .min(f64::from(limit.capacity));
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with full jitter.
///
/// Delay for attempt `n` (0-based) is uniform in
/// `[0, min(base · 2ⁿ, cap)]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Standard backoff for provider/LLM retries: 500 ms base, 30 s cap.
    pub fn standard() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }

    /// Backoff with explicit base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Jittered delay for the given 0-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .checked_mul(2u32.saturating_pow(attempt.min(16)))
            .unwrap_or(self.cap)
            .min(self.cap);
        if exp.is_zero() {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis());
        Duration::from_millis(u64::try_from(jittered).unwrap_or(u64::MAX))
    }
}

/// Retry floor for errored sync pushes: 5 minutes doubling per attempt,
/// capped at 1 hour.
pub fn sync_retry_floor(attempts: u32) -> Duration {
    let base = Duration::from_secs(300);
    base.checked_mul(2u32.saturating_pow(attempts.min(8)))
        .unwrap_or(Duration::from_secs(3600))
        .min(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn limits_with(capacity: u32, refill_per_sec: f64) -> LimitsConfig {
        let mut limits = LimitsConfig::default();
        limits.provider_rate_limits.clear();
        limits.provider_rate_limits.insert(
            "calendar".to_owned(),
            RateLimitConfig {
                capacity,
                refill_per_sec,
            },
        );
        limits
    }

    #[tokio::test]
    async fn test_bucket_exhausts_and_refills() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(&limits_with(2, 1.0), clock.clone());
        let user = UserId::from("u1");

        assert!(limiter.try_acquire(&user, Provider::Calendar).await);
        assert!(limiter.try_acquire(&user, Provider::Calendar).await);
        assert!(
            !limiter.try_acquire(&user, Provider::Calendar).await,
            "third call within the window must be denied"
        );

        clock.advance(Duration::from_secs(1));
        assert!(
            limiter.try_acquire(&user, Provider::Calendar).await,
            "refill should restore one token per second"
        );
    }

    #[tokio::test]
    async fn test_buckets_isolated_per_user() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(&limits_with(1, 0.1), clock);

        assert!(limiter.try_acquire(&UserId::from("a"), Provider::Calendar).await);
        assert!(
            limiter.try_acquire(&UserId::from("b"), Provider::Calendar).await,
            "one user's exhaustion must not throttle another"
        );
        assert!(!limiter.try_acquire(&UserId::from("a"), Provider::Calendar).await);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_unmetered() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(&limits_with(1, 1.0), clock);
        let user = UserId::from("u1");
        for _ in 0..10 {
            assert!(limiter.try_acquire(&user, Provider::Mail).await);
        }
    }

    #[test]
    fn test_backoff_delay_bounded() {
        let backoff = Backoff::standard();
        for attempt in 0..20 {
            let delay = backoff.delay(attempt);
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_sync_retry_floor_caps_at_one_hour() {
        assert_eq!(sync_retry_floor(0), Duration::from_secs(300));
        assert_eq!(sync_retry_floor(1), Duration::from_secs(600));
        assert_eq!(sync_retry_floor(10), Duration::from_secs(3600));
        assert_eq!(sync_retry_floor(u32::MAX), Duration::from_secs(3600));
    }
}
