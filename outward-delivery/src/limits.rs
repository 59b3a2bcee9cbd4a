//! Keyed concurrency and rate limiting.
//!
//! Concurrency is a per-key semaphore; sustained rate is a per-key token
//! bucket refilled at a constant rate with a burst allowance. A [`Slot`]
//! holds the concurrency permit and releases it on drop, so a slot taken
//! at transaction start is released no matter how the transaction ends.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::{KeyedLimiterConfig, LimitsConfig};

/// Capacity held for one in-flight message or domain transfer. Dropping
/// it releases the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
    }
}

/// Bounds in-flight work per key.
pub struct KeyedLimiter {
    max_concurrent: usize,
    rate_per_sec: Option<f64>,
    rate_burst: u32,
    take_timeout: Duration,
    semaphores: DashMap<String, Arc<Semaphore>, ahash::RandomState>,
    buckets: DashMap<String, Arc<parking_lot::Mutex<TokenBucket>>, ahash::RandomState>,
}

impl KeyedLimiter {
    #[must_use]
    pub fn new(config: &KeyedLimiterConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            rate_per_sec: config.rate_per_sec,
            rate_burst: config.rate_burst,
            take_timeout: config.take_timeout(),
            semaphores: DashMap::default(),
            buckets: DashMap::default(),
        }
    }

    /// Acquires a slot for `key`, waiting up to the configured timeout for
    /// both a concurrency permit and rate capacity. `None` means capacity
    /// did not free up in time and the caller should defer.
    pub async fn take(&self, key: &str) -> Option<Slot> {
        let deadline = tokio::time::Instant::now() + self.take_timeout;

        let permit = if self.max_concurrent == 0 {
            None
        } else {
            let semaphore = self
                .semaphores
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
                .clone();

            match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) | Err(_) => {
                    debug!(key, "no concurrency slot freed up within the take timeout");
                    return None;
                }
            }
        };

        if let Some(rate) = self.rate_per_sec {
            let bucket = self
                .buckets
                .entry(key.to_owned())
                .or_insert_with(|| {
                    Arc::new(parking_lot::Mutex::new(TokenBucket::new(rate, self.rate_burst)))
                })
                .clone();

            loop {
                let wait = {
                    let mut bucket = bucket.lock();
                    if bucket.try_consume() {
                        break;
                    }
                    bucket.time_until_available()
                };

                if tokio::time::Instant::now() + wait > deadline {
                    debug!(key, "rate capacity not available within the take timeout");
                    return None;
                }
                tokio::time::sleep(wait).await;
            }
        }

        Some(Slot { _permit: permit })
    }

    /// Drops per-key state nothing holds and nothing would miss: idle
    /// semaphores, and buckets that have refilled to capacity (a full
    /// bucket behaves exactly like a fresh one).
    pub fn prune(&self) {
        self.semaphores
            .retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        self.buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || {
                let mut bucket = bucket.lock();
                bucket.refill();
                bucket.tokens < bucket.capacity
            }
        });
    }
}

/// The two limiter scopes a delivery passes through: one keyed by message
/// source when the transaction starts, one keyed by destination domain for
/// each concurrent transfer.
pub struct Limits {
    source: KeyedLimiter,
    destination: KeyedLimiter,
}

impl Limits {
    #[must_use]
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            source: KeyedLimiter::new(&config.source),
            destination: KeyedLimiter::new(&config.destination),
        }
    }

    pub async fn take_message(&self, source: &str) -> Option<Slot> {
        self.source.take(source).await
    }

    pub async fn take_domain(&self, domain: &str) -> Option<Slot> {
        self.destination.take(domain).await
    }

    pub fn prune(&self) {
        self.source.prune();
        self.destination.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_concurrent: usize, rate_per_sec: Option<f64>) -> KeyedLimiter {
        KeyedLimiter::new(&KeyedLimiterConfig {
            max_concurrent,
            rate_per_sec,
            rate_burst: 2,
            take_timeout_secs: 0,
        })
    }

    #[tokio::test]
    async fn unbounded_by_default() {
        let limiter = KeyedLimiter::new(&KeyedLimiterConfig::default());
        for _ in 0..64 {
            assert!(limiter.take("example.org").await.is_some());
        }
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_until_release() {
        let limiter = limiter(1, None);

        let held = limiter.take("example.org").await.unwrap();
        assert!(limiter.take("example.org").await.is_none());

        drop(held);
        assert!(limiter.take("example.org").await.is_some());
    }

    #[tokio::test]
    async fn keys_do_not_contend() {
        let limiter = limiter(1, None);

        let _held = limiter.take("a.example.org").await.unwrap();
        assert!(limiter.take("b.example.org").await.is_some());
    }

    #[tokio::test]
    async fn burst_exhaustion_defers() {
        let limiter = limiter(0, Some(0.001));

        assert!(limiter.take("example.org").await.is_some());
        assert!(limiter.take("example.org").await.is_some());
        assert!(limiter.take("example.org").await.is_none());
    }

    #[tokio::test]
    async fn prune_keeps_held_keys() {
        let limiter = limiter(1, Some(0.001));

        let held = limiter.take("example.org").await.unwrap();
        limiter.prune();
        assert_eq!(limiter.semaphores.len(), 1);
        assert_eq!(limiter.buckets.len(), 1);

        drop(held);
        limiter.prune();
        assert_eq!(limiter.semaphores.len(), 0);
        // the bucket is below capacity and still remembers the consumption
        assert_eq!(limiter.buckets.len(), 1);
    }

    #[tokio::test]
    async fn prune_drops_refilled_buckets() {
        let limiter = limiter(0, Some(10_000.0));

        assert!(limiter.take("example.org").await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;

        limiter.prune();
        assert_eq!(limiter.buckets.len(), 0);
    }
}
