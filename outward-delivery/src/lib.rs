//! Outbound delivery engine: gets locally-accepted mail to remote
//! mailboxes.
//!
//! This crate provides the pieces a queue drives to deliver one message:
//! - Endpoint resolution with administrative overrides and MX caching
//! - A bounded pool of reusable SMTP sessions keyed by destination
//! - Pluggable transport-security policies checked per transaction
//! - An opportunistic direct-transfer path tried before SMTP
//! - Per-domain fan-out with temporary/permanent error aggregation

mod config;
mod connect;
mod delivery;
mod error;
mod fastpath;
mod limits;
mod overrides;
mod policy;
mod pool;
mod resolver;
mod target;

// Re-export configuration types
pub use config::{
    DeliveryConfig, DnsConfig, FastPathConfig, KeyedLimiterConfig, LimitsConfig, PoolConfig,
    TimeoutConfig, TlsConfig, TlsPolicy,
};
// Re-export error types
pub use error::{InitError, ResolveError};
pub use fastpath::FastPathOutcome;
// Re-export override administration types
pub use overrides::{
    FileOverrideStore, MemoryOverrideStore, OverrideEntry, OverrideStore, StoreError,
    normalize_key,
};
pub use policy::{DeliveryPolicy, MinSecurityPolicy, SecurityLevel, SecurityPolicy};
// Re-export resolver types
pub use resolver::{EndpointResolver, MxRecord, MxResolver, StaticResolver, SystemResolver};
// Re-export the engine itself
pub use target::{Target, TargetBuilder};

// Re-export the shared vocabulary so callers need only this crate
pub use outward_common::{
    Domain, EnhancedCode, Status, address,
    message::{MessageBody, MessageHeader, MessageMeta},
    target::{DeliveryTarget, StatusCollector, StatusMap, Transaction},
};
