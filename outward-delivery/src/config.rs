//! Delivery engine configuration.
//!
//! Everything here deserializes from the config file with per-field
//! defaults, so a minimal deployment only sets `hostname`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Local hostname, presented in EHLO/HELO.
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub fastpath: FastPathConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Transactions a connection may serve before it is closed instead of
    /// returned to the pool.
    #[serde(default = "defaults::conn_reuse_limit")]
    pub conn_reuse_limit: usize,

    /// Whether a message flagged with an explicit security-requirement
    /// override may skip per-domain policy evaluation. Off by default; a
    /// skip is always logged.
    #[serde(default)]
    pub allow_security_override: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            tls: TlsConfig::default(),
            timeouts: TimeoutConfig::default(),
            pool: PoolConfig::default(),
            limits: LimitsConfig::default(),
            fastpath: FastPathConfig::default(),
            dns: DnsConfig::default(),
            conn_reuse_limit: defaults::conn_reuse_limit(),
            allow_security_override: false,
        }
    }
}

/// TLS negotiation policy for outbound sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Attempt STARTTLS, fall back to plaintext if the server refuses it or
    /// the handshake fails.
    #[default]
    Opportunistic,

    /// Fail delivery to any host where TLS cannot be negotiated.
    Required,

    /// Never attempt STARTTLS.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Skip certificate verification during STARTTLS. Sessions negotiated
    /// this way count as encrypted but not authenticated.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// The three timeout classes, each enforced per operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP connection establishment.
    ///
    /// Default: 300 seconds (5 minutes, per RFC 5321)
    #[serde(default = "defaults::connect_secs")]
    pub connect_secs: u64,

    /// One command round-trip (EHLO, MAIL FROM, RCPT TO, DATA, STARTTLS).
    ///
    /// Default: 300 seconds (5 minutes, per RFC 5321)
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// Payload transfer plus the end-of-data reply, the stage where remote
    /// servers legitimately take longest.
    ///
    /// Default: 720 seconds (12 minutes)
    #[serde(default = "defaults::data_secs")]
    pub data_secs: u64,
}

impl TimeoutConfig {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect_secs(),
            command_secs: defaults::command_secs(),
            data_secs: defaults::data_secs(),
        }
    }
}

/// Idle connection cache bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of destination keys held at once.
    ///
    /// Default: 5000
    #[serde(default = "defaults::pool_max_keys")]
    pub max_keys: usize,

    /// Maximum idle connections kept per key.
    ///
    /// Default: 5
    #[serde(default = "defaults::pool_max_conns_per_key")]
    pub max_conns_per_key: usize,

    /// An idle connection older than this is discarded instead of reused.
    ///
    /// Default: 150 seconds
    #[serde(default = "defaults::pool_max_conn_lifetime_secs")]
    pub max_conn_lifetime_secs: u64,

    /// A key untouched for longer than this is evicted entirely.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::pool_stale_key_secs")]
    pub stale_key_secs: u64,
}

impl PoolConfig {
    #[must_use]
    pub const fn max_conn_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_conn_lifetime_secs)
    }

    #[must_use]
    pub const fn stale_key_window(&self) -> Duration {
        Duration::from_secs(self.stale_key_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_keys: defaults::pool_max_keys(),
            max_conns_per_key: defaults::pool_max_conns_per_key(),
            max_conn_lifetime_secs: defaults::pool_max_conn_lifetime_secs(),
            stale_key_secs: defaults::pool_stale_key_secs(),
        }
    }
}

/// Bounds for one keyed limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyedLimiterConfig {
    /// Maximum in-flight messages per key. 0 means unbounded.
    #[serde(default)]
    pub max_concurrent: usize,

    /// Sustained message rate per key, per second. `None` means unlimited.
    #[serde(default)]
    pub rate_per_sec: Option<f64>,

    /// Burst allowance on top of the sustained rate (token bucket
    /// capacity).
    ///
    /// Default: 20
    #[serde(default = "defaults::limiter_rate_burst")]
    pub rate_burst: u32,

    /// How long a take may wait for a slot before failing with a temporary
    /// error.
    ///
    /// Default: 15 seconds
    #[serde(default = "defaults::limiter_take_timeout_secs")]
    pub take_timeout_secs: u64,
}

impl KeyedLimiterConfig {
    #[must_use]
    pub const fn take_timeout(&self) -> Duration {
        Duration::from_secs(self.take_timeout_secs)
    }
}

impl Default for KeyedLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            rate_per_sec: None,
            rate_burst: defaults::limiter_rate_burst(),
            take_timeout_secs: defaults::limiter_take_timeout_secs(),
        }
    }
}

/// In-flight message bounds per source and per destination domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LimitsConfig {
    /// Keyed by (source IP, sender domain).
    #[serde(default)]
    pub source: KeyedLimiterConfig,

    /// Keyed by destination domain.
    #[serde(default)]
    pub destination: KeyedLimiterConfig,
}

/// The opportunistic direct-transfer path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FastPathConfig {
    /// Default: enabled. Failures always fall back to SMTP silently.
    #[serde(default = "defaults::fastpath_enabled")]
    pub enabled: bool,

    /// Whole-request timeout.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::fastpath_timeout_secs")]
    pub timeout_secs: u64,

    /// Port to contact on the target host. `None` uses the scheme default.
    #[serde(default)]
    pub port: Option<u16>,
}

impl FastPathConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::fastpath_enabled(),
            timeout_secs: defaults::fastpath_timeout_secs(),
            port: None,
        }
    }
}

/// MX resolution tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout.
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::dns_timeout_secs")]
    pub timeout_secs: u64,

    /// Override the record TTL for all cached entries. `None` (the
    /// default) respects the authoritative TTL, clamped below.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Lower clamp on cache TTL, preventing query storms for records with
    /// very short TTLs.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::dns_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Upper clamp on cache TTL, ensuring eventual refresh.
    ///
    /// Default: 3600 seconds
    #[serde(default = "defaults::dns_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::dns_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: defaults::dns_min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::dns_max_cache_ttl_secs(),
        }
    }
}

mod defaults {
    pub const fn connect_secs() -> u64 {
        300 // 5 minutes
    }
    pub const fn command_secs() -> u64 {
        300 // 5 minutes
    }
    pub const fn data_secs() -> u64 {
        720 // 12 minutes
    }

    pub const fn pool_max_keys() -> usize {
        5000
    }
    pub const fn pool_max_conns_per_key() -> usize {
        5
    }
    pub const fn pool_max_conn_lifetime_secs() -> u64 {
        150
    }
    pub const fn pool_stale_key_secs() -> u64 {
        300
    }

    pub const fn limiter_rate_burst() -> u32 {
        20
    }
    pub const fn limiter_take_timeout_secs() -> u64 {
        15
    }

    pub const fn conn_reuse_limit() -> usize {
        10
    }

    pub const fn fastpath_enabled() -> bool {
        true
    }
    pub const fn fastpath_timeout_secs() -> u64 {
        30
    }

    pub const fn dns_timeout_secs() -> u64 {
        5
    }
    pub const fn dns_min_cache_ttl_secs() -> u64 {
        60 // 1 minute
    }
    pub const fn dns_max_cache_ttl_secs() -> u64 {
        3600 // 1 hour
    }
}
