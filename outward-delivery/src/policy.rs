//! Pluggable transport-security policy.
//!
//! A [`SecurityPolicy`] is registered on the target; each transaction
//! start snapshots it into a per-message [`DeliveryPolicy`] checker, so a
//! policy may carry per-message state (cached lookups, negotiated
//! expectations) without synchronizing across messages. Checkers run in
//! registration order and the first rejection wins.

use async_trait::async_trait;
use outward_common::{EnhancedCode, Status, message::MessageMeta};
use tracing::warn;

use crate::{config::TlsPolicy, resolver::MxRecord};

/// Transport security negotiated on a connection, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No TLS.
    Plaintext,
    /// TLS established but the certificate was not verified.
    Encrypted,
    /// TLS established and the certificate chain verified.
    Authenticated,
}

/// A policy registered on the delivery target.
pub trait SecurityPolicy: Send + Sync {
    /// Produces the per-message checker for one transaction.
    fn start(&self, meta: &MessageMeta) -> Box<dyn DeliveryPolicy>;
}

/// Per-message policy checker.
///
/// Both checks default to approval so a policy only implements the stage
/// it cares about.
#[async_trait]
pub trait DeliveryPolicy: Send + Sync {
    /// Vetoes a domain's exchanger candidates before any connection is
    /// attempted.
    async fn check_mx(&self, domain: &str, records: &[MxRecord]) -> Result<(), Status> {
        let _ = (domain, records);
        Ok(())
    }

    /// Vetoes an established (possibly pooled) connection given the
    /// security level it actually negotiated.
    async fn check_connection(
        &self,
        domain: &str,
        mx_host: &str,
        security: SecurityLevel,
    ) -> Result<(), Status> {
        let _ = (domain, mx_host, security);
        Ok(())
    }
}

/// Rejects connections below a fixed security level.
pub struct MinSecurityPolicy {
    required: SecurityLevel,
}

impl MinSecurityPolicy {
    #[must_use]
    pub const fn new(required: SecurityLevel) -> Self {
        Self { required }
    }

    /// The policy implied by a TLS configuration, if any.
    #[must_use]
    pub const fn from_tls_policy(policy: TlsPolicy) -> Option<Self> {
        match policy {
            TlsPolicy::Required => Some(Self::new(SecurityLevel::Encrypted)),
            TlsPolicy::Opportunistic | TlsPolicy::Disabled => None,
        }
    }
}

impl SecurityPolicy for MinSecurityPolicy {
    fn start(&self, _meta: &MessageMeta) -> Box<dyn DeliveryPolicy> {
        Box::new(Self { required: self.required })
    }
}

#[async_trait]
impl DeliveryPolicy for MinSecurityPolicy {
    async fn check_connection(
        &self,
        _domain: &str,
        _mx_host: &str,
        security: SecurityLevel,
    ) -> Result<(), Status> {
        if security < self.required {
            return Err(Status::new(
                550,
                EnhancedCode(5, 7, 1),
                "TLS is required but was not negotiated",
            ));
        }
        Ok(())
    }
}

/// Snapshots the registered policies for one transaction.
///
/// A message flagged to bypass security checks gets an empty chain when
/// the configuration allows the bypass; the skip is always logged.
pub(crate) fn snapshot(
    policies: &[Box<dyn SecurityPolicy>],
    meta: &MessageMeta,
    allow_security_override: bool,
) -> Vec<Box<dyn DeliveryPolicy>> {
    if meta.security_override {
        if allow_security_override {
            warn!(message = meta.id, "security policy checks disabled for this message");
            return Vec::new();
        }
        warn!(
            message = meta.id,
            "message requested a security override but overrides are not allowed"
        );
    }

    policies.iter().map(|policy| policy.start(meta)).collect()
}

pub(crate) async fn check_mx(
    policies: &[Box<dyn DeliveryPolicy>],
    domain: &str,
    records: &[MxRecord],
) -> Result<(), Status> {
    for policy in policies {
        policy.check_mx(domain, records).await?;
    }
    Ok(())
}

pub(crate) async fn check_connection(
    policies: &[Box<dyn DeliveryPolicy>],
    domain: &str,
    mx_host: &str,
    security: SecurityLevel,
) -> Result<(), Status> {
    for policy in policies {
        policy.check_connection(domain, mx_host, security).await?;
    }
    Ok(())
}
