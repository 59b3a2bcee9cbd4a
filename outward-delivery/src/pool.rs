//! Keyed idle-connection pool.
//!
//! Each destination key holds a small stack of idle connections. Checkout
//! takes the most recently returned one that is still within its lifetime,
//! so the hottest connection is reused and cold ones age out. Keys that go
//! quiet are discarded wholesale by the sweep.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::config::PoolConfig;

struct Idle<C> {
    conn: C,
    inserted_at: Instant,
}

struct Bucket<C> {
    idle: VecDeque<Idle<C>>,
    last_touch: Instant,
}

pub struct ConnectionPool<C> {
    buckets: DashMap<String, Bucket<C>, ahash::RandomState>,
    closed: AtomicBool,
    max_keys: usize,
    max_per_key: usize,
    max_lifetime: Duration,
    stale_window: Duration,
}

impl<C> ConnectionPool<C> {
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            buckets: DashMap::default(),
            closed: AtomicBool::new(false),
            max_keys: config.max_keys,
            max_per_key: config.max_conns_per_key,
            max_lifetime: config.max_conn_lifetime(),
            stale_window: config.stale_key_window(),
        }
    }

    /// Takes the most recently returned connection for `key` that has not
    /// outlived its pooled lifetime. Older entries encountered on the way
    /// are dropped.
    pub fn get(&self, key: &str) -> Option<C> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut bucket = self.buckets.get_mut(key)?;
        bucket.last_touch = Instant::now();

        while let Some(idle) = bucket.idle.pop_back() {
            if idle.inserted_at.elapsed() < self.max_lifetime {
                return Some(idle.conn);
            }
        }

        None
    }

    /// Parks a connection for reuse. The oldest entry is evicted once the
    /// per-key cap is exceeded.
    ///
    /// Returns the connection back to the caller when the pool refuses it
    /// (closed, or pooling disabled), so the caller can shut it down
    /// gracefully.
    pub fn put(&self, key: &str, conn: C) -> Option<C> {
        if self.max_per_key == 0 || self.closed.load(Ordering::Acquire) {
            return Some(conn);
        }

        if self.buckets.len() >= self.max_keys && !self.buckets.contains_key(key) {
            self.evict_stalest_key();
        }

        let mut bucket = self.buckets.entry(key.to_owned()).or_insert_with(|| Bucket {
            idle: VecDeque::new(),
            last_touch: Instant::now(),
        });
        bucket.last_touch = Instant::now();
        bucket.idle.push_back(Idle {
            conn,
            inserted_at: Instant::now(),
        });
        while bucket.idle.len() > self.max_per_key {
            bucket.idle.pop_front();
        }

        None
    }

    /// Drops connections past their lifetime and keys with no activity in
    /// the stale window.
    pub fn sweep(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.buckets.retain(|_, bucket| {
            bucket
                .idle
                .retain(|idle| idle.inserted_at.elapsed() < self.max_lifetime);
            bucket.last_touch.elapsed() < self.stale_window
        });
    }

    /// Closes the pool. Pending idle connections are dropped; subsequent
    /// checkouts fail fast and returns are handed back to the caller.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.buckets.clear();
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.buckets.iter().map(|entry| entry.value().idle.len()).sum()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    fn evict_stalest_key(&self) {
        let stalest = self
            .buckets
            .iter()
            .min_by_key(|entry| entry.value().last_touch)
            .map(|entry| entry.key().clone());

        if let Some(key) = stalest {
            self.buckets.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    #[test]
    fn checkout_prefers_the_most_recently_returned() {
        let pool = ConnectionPool::new(&config());
        assert!(pool.put("example.org", "first").is_none());
        assert!(pool.put("example.org", "second").is_none());

        assert_eq!(pool.get("example.org"), Some("second"));
        assert_eq!(pool.get("example.org"), Some("first"));
        assert_eq!(pool.get("example.org"), None);
    }

    #[test]
    fn per_key_cap_evicts_the_oldest() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_conns_per_key: 2,
            ..config()
        });
        pool.put("example.org", 1);
        pool.put("example.org", 2);
        pool.put("example.org", 3);

        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.get("example.org"), Some(3));
        assert_eq!(pool.get("example.org"), Some(2));
        assert_eq!(pool.get("example.org"), None);
    }

    #[test]
    fn expired_connections_are_not_handed_out() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_conn_lifetime_secs: 0,
            ..config()
        });
        pool.put("example.org", "conn");
        assert_eq!(pool.get("example.org"), None);
    }

    #[test]
    fn closed_pool_fails_fast() {
        let pool = ConnectionPool::new(&config());
        pool.put("example.org", "conn");
        pool.close();

        assert_eq!(pool.get("example.org"), None);
        assert_eq!(pool.put("example.org", "rejected"), Some("rejected"));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn pooling_disabled_hands_every_connection_back() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_conns_per_key: 0,
            ..config()
        });
        assert_eq!(pool.put("example.org", "conn"), Some("conn"));
    }

    #[test]
    fn sweep_discards_quiet_keys() {
        let pool = ConnectionPool::new(&PoolConfig {
            stale_key_secs: 0,
            ..config()
        });
        pool.put("example.org", "conn");
        assert_eq!(pool.key_count(), 1);

        pool.sweep();
        assert_eq!(pool.key_count(), 0);
    }

    #[test]
    fn sweep_discards_expired_connections_but_keeps_live_keys() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_conn_lifetime_secs: 0,
            ..config()
        });
        pool.put("example.org", "conn");

        pool.sweep();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.key_count(), 1);
    }

    #[test]
    fn key_pressure_evicts_the_stalest_key() {
        let pool = ConnectionPool::new(&PoolConfig {
            max_keys: 2,
            ..config()
        });
        pool.put("a.example.org", 1);
        std::thread::sleep(Duration::from_millis(5));
        pool.put("b.example.org", 2);
        std::thread::sleep(Duration::from_millis(5));

        // touch a so b becomes the stalest
        let conn = pool.get("a.example.org").unwrap();
        pool.put("a.example.org", conn);
        std::thread::sleep(Duration::from_millis(5));

        pool.put("c.example.org", 3);
        assert_eq!(pool.key_count(), 2);
        assert_eq!(pool.get("b.example.org"), None);
        assert_eq!(pool.get("a.example.org"), Some(1));
        assert_eq!(pool.get("c.example.org"), Some(3));
    }
}
