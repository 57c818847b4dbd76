//! Requeue rate limiting for the work queue
//!
//! Implements:
//! - Per-item exponential failure backoff
//! - Overall token bucket (shared by every item)
//! - Worst-case combination of several limiters

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default base delay for per-item backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap for per-item backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default overall requeue rate
pub const DEFAULT_QPS: f64 = 10.0;

/// Default overall burst
pub const DEFAULT_BURST: u32 = 100;

/// Decides how long an item waits before it is requeued
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next requeue of `item`; records a failure
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`, resetting its backoff
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item`
    fn num_requeues(&self, item: &T) -> u32;
}

/// `base * 2^failures`, capped at `max_delay`
pub struct ItemExponentialFailureRateLimiter<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: DashMap<T, u32>,
}

impl<T: Eq + Hash> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: DashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let exp = *entry;
            *entry = entry.saturating_add(1);
            exp
        };

        // Anything past 2^31 is far beyond any sane cap
        let factor = 2u32.checked_pow(exp.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map(|v| *v).unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket over all items
///
/// Every call reserves a token; once the bucket is empty the returned delay
/// is the time until the reserved token is refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Returns the worst case of all its limiters
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Tunables for the controller's rate limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// First per-item retry delay
    pub base_delay: Duration,
    /// Upper bound for per-item retry delay
    pub max_delay: Duration,
    /// Overall requeue rate (0 disables the bucket)
    pub qps: f64,
    /// Overall burst
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl RateLimitConfig {
    /// Per-item exponential backoff combined with an overall token bucket
    pub fn build<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Eq + Hash + Clone + Send + Sync + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

/// The limiter controllers use unless configured otherwise
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    RateLimitConfig::default().build()
}
