//! The delivery target: process-wide engine state and its entry point.
//!
//! One [`Target`] is built at startup and shared by every message source.
//! It owns the endpoint resolver, the connection pool, the limiters, the
//! direct-transfer client, and the registered security policies; each
//! [`DeliveryTarget::start`] call snapshots that state into one
//! transaction.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use outward_common::{
    EnhancedCode, Status, address,
    message::MessageMeta,
    target::{DeliveryTarget, Transaction},
};
use tracing::{debug, info};

use crate::{
    config::DeliveryConfig,
    connect::MxConn,
    delivery::Delivery,
    error::InitError,
    fastpath::FastPath,
    limits::Limits,
    overrides::{MemoryOverrideStore, OverrideStore},
    policy::{self, MinSecurityPolicy, SecurityPolicy},
    pool::ConnectionPool,
    resolver::{EndpointResolver, MxResolver, SystemResolver},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct TargetInner {
    pub config: DeliveryConfig,
    pub resolver: EndpointResolver,
    pub pool: ConnectionPool<MxConn>,
    pub limits: Limits,
    pub policies: Vec<Box<dyn SecurityPolicy>>,
    pub fastpath: FastPath,
    last_sweep: parking_lot::Mutex<Instant>,
}

/// The outbound delivery engine.
pub struct Target {
    inner: Arc<TargetInner>,
}

impl Target {
    #[must_use]
    pub fn builder(config: DeliveryConfig) -> TargetBuilder {
        TargetBuilder {
            config,
            store: None,
            dns: None,
            policies: Vec::new(),
        }
    }

    /// The endpoint resolver, exposed for override administration.
    #[must_use]
    pub fn resolver(&self) -> &EndpointResolver {
        &self.inner.resolver
    }

    /// Shuts the engine down: drains the pool and fails subsequent
    /// checkouts fast. In-flight transactions finish on their own
    /// connections.
    pub fn close(&self) {
        self.inner.pool.close();
        info!("delivery target closed");
    }

    fn maybe_sweep(&self) {
        {
            let mut last = self.inner.last_sweep.lock();
            if last.elapsed() < SWEEP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        self.inner.pool.sweep();
        self.inner.limits.prune();
        debug!("swept idle connections and limiter state");
    }
}

#[async_trait]
impl DeliveryTarget for Target {
    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Transaction>, Status> {
        self.maybe_sweep();

        // the null return path yields an empty domain, which shares one
        // limiter bucket; that is fine for bounce traffic
        let Ok((_, sender_domain)) = address::split(mail_from) else {
            return Err(Status::new(
                501,
                EnhancedCode(5, 1, 8),
                "Malformed sender address",
            ));
        };
        let source_key = match meta.source_ip {
            Some(ip) => format!("{ip}/{sender_domain}"),
            None => sender_domain.to_owned(),
        };

        let Some(msg_slot) = self.inner.limits.take_message(&source_key).await else {
            return Err(Status::new(
                451,
                EnhancedCode(4, 4, 5),
                "High load, try again later",
            ));
        };

        let policies = policy::snapshot(
            &self.inner.policies,
            meta,
            self.inner.config.allow_security_override,
        );

        debug!(message = meta.id, mail_from, "transaction started");

        Ok(Box::new(Delivery::new(
            Arc::clone(&self.inner),
            meta.clone(),
            mail_from.to_owned(),
            policies,
            Some(msg_slot),
        )))
    }
}

/// Assembles a [`Target`], letting callers swap the override store, the
/// DNS backend, and the policy chain.
pub struct TargetBuilder {
    config: DeliveryConfig,
    store: Option<Arc<dyn OverrideStore>>,
    dns: Option<Arc<dyn MxResolver>>,
    policies: Vec<Box<dyn SecurityPolicy>>,
}

impl TargetBuilder {
    /// Backs override rows with `store` instead of the in-memory default.
    #[must_use]
    pub fn override_store(mut self, store: Arc<dyn OverrideStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Answers MX and address queries from `dns` instead of the system
    /// resolver.
    #[must_use]
    pub fn dns_resolver(mut self, dns: Arc<dyn MxResolver>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Appends a policy to the chain. Policies run in registration order.
    #[must_use]
    pub fn policy(mut self, policy: Box<dyn SecurityPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// # Errors
    /// [`InitError`] when the system resolver or the direct-transfer
    /// client cannot be constructed.
    pub fn build(self) -> Result<Target, InitError> {
        let dns: Arc<dyn MxResolver> = match self.dns {
            Some(dns) => dns,
            None => Arc::new(SystemResolver::new(&self.config.dns)?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryOverrideStore::new()));

        let mut policies = self.policies;
        if let Some(min) = MinSecurityPolicy::from_tls_policy(self.config.tls.policy) {
            policies.push(Box::new(min));
        }

        let inner = TargetInner {
            resolver: EndpointResolver::new(store, dns, self.config.dns),
            pool: ConnectionPool::new(&self.config.pool),
            limits: Limits::new(&self.config.limits),
            fastpath: FastPath::new(&self.config.fastpath)?,
            policies,
            config: self.config,
            last_sweep: parking_lot::Mutex::new(Instant::now()),
        };

        info!(
            hostname = inner.config.hostname,
            tls = ?inner.config.tls.policy,
            "delivery target ready"
        );

        Ok(Target {
            inner: Arc::new(inner),
        })
    }
}
