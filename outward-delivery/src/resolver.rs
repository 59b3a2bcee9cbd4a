//! Endpoint resolution: the override table first, then MX lookup with
//! A/AAAA fallback per RFC 5321 §5.1.
//!
//! Results are cached using the record TTL (clamped by configuration) in a
//! lock-free map. The implicit-MX fallback keeps the *domain name* as the
//! connection target rather than substituting resolved addresses, so TLS
//! certificate verification still sees the right name.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
    proto::rr::Record,
};
use rand::seq::SliceRandom;
use tracing::debug;

use crate::{
    config::DnsConfig,
    error::ResolveError,
    overrides::{OverrideEntry, OverrideStore, StoreError, normalize_key},
};

/// One candidate mail exchanger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Exchanger hostname or literal address.
    pub host: String,
    /// MX preference; lower is tried first. 0 for synthesized records.
    pub preference: u16,
    /// Port to contact, 25 unless an override carried one.
    pub port: u16,
}

impl MxRecord {
    #[must_use]
    pub const fn new(host: String, preference: u16) -> Self {
        Self {
            host,
            preference,
            port: 25,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port`, bracketing literal IPv6 addresses so the result can be
    /// passed straight to a connector.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// The DNS questions endpoint resolution needs answered.
///
/// `lookup_mx` returns an empty record set when the domain exists but has
/// no MX records, which triggers the implicit-MX fallback; `lookup_ips`
/// likewise reports "no addresses" as an empty set rather than an error.
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<(Vec<MxRecord>, u32), ResolveError>;

    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// [`MxResolver`] backed by the system DNS configuration.
#[derive(Debug)]
pub struct SystemResolver {
    resolver: TokioResolver,
}

impl SystemResolver {
    /// # Errors
    /// If the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, ResolveError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }
}

#[async_trait]
impl MxResolver for SystemResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<(Vec<MxRecord>, u32), ResolveError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let min_ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(300);

                let records = lookup
                    .iter()
                    .map(|mx| {
                        let name = mx.exchange().to_utf8();
                        // keep the root name intact: it is the null MX marker
                        let host = if name == "." {
                            name
                        } else {
                            name.strip_suffix('.').map_or_else(|| name.clone(), str::to_owned)
                        };
                        MxRecord::new(host, mx.preference())
                    })
                    .collect();

                Ok((records, min_ttl))
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => Ok((Vec::new(), 300)),
            Err(err) => Err(err.into()),
        }
    }

    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// [`MxResolver`] answering from fixed zone data. Used by tests and by
/// deployments that pin their exchangers.
#[derive(Debug, Default)]
pub struct StaticResolver {
    mx: DashMap<String, Vec<MxRecord>>,
    ips: DashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mx(self, domain: &str, records: Vec<MxRecord>) -> Self {
        self.mx.insert(normalize_key(domain), records);
        self
    }

    /// Declares the domain as explicitly refusing mail (RFC 7505).
    #[must_use]
    pub fn with_null_mx(self, domain: &str) -> Self {
        self.with_mx(domain, vec![MxRecord::new(".".to_owned(), 0)])
    }

    #[must_use]
    pub fn with_ips(self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.ips.insert(normalize_key(host), addrs);
        self
    }
}

#[async_trait]
impl MxResolver for StaticResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<(Vec<MxRecord>, u32), ResolveError> {
        let records = self
            .mx
            .get(&normalize_key(domain))
            .map(|records| records.clone())
            .unwrap_or_default();
        Ok((records, 300))
    }

    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        Ok(self
            .ips
            .get(&normalize_key(host))
            .map(|addrs| addrs.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct CachedMx {
    records: Arc<Vec<MxRecord>>,
    expires_at: Instant,
}

/// Resolves destination keys to ordered exchanger candidates, consulting
/// the override table before DNS.
pub struct EndpointResolver {
    store: Arc<dyn OverrideStore>,
    dns: Arc<dyn MxResolver>,
    cache: DashMap<String, CachedMx>,
    config: DnsConfig,
}

impl EndpointResolver {
    pub fn new(store: Arc<dyn OverrideStore>, dns: Arc<dyn MxResolver>, config: DnsConfig) -> Self {
        Self {
            store,
            dns,
            cache: DashMap::new(),
            config,
        }
    }

    /// Resolves a key to a single target host, without DNS.
    ///
    /// An override row is authoritative and returns its target verbatim. A
    /// literal IP is its own endpoint. A domain returns `None`: the caller
    /// must resolve it through standard DNS itself, preserving certificate
    /// name matching and any name-keyed transport policy.
    ///
    /// # Errors
    /// Only if the override table cannot be read.
    pub fn resolve(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = normalize_key(key);

        if let Some(entry) = self.store.get(&key)? {
            return Ok(Some(entry.target));
        }

        if key.parse::<IpAddr>().is_ok() {
            return Ok(Some(key));
        }

        Ok(None)
    }

    /// Resolves a domain to its ordered exchanger list.
    ///
    /// Returns the records and whether they came from the cache (an
    /// override row counts as a hit; no query was issued). Records are
    /// ordered by preference with equal-preference groups shuffled.
    ///
    /// # Errors
    /// [`ResolveError::NullMx`] and [`ResolveError::NoServers`] are
    /// terminal for the domain; [`ResolveError::Lookup`] may be temporary.
    pub async fn resolve_mx(
        &self,
        domain: &str,
    ) -> Result<(Arc<Vec<MxRecord>>, bool), ResolveError> {
        let key = normalize_key(domain);

        if let Some(entry) = self.store.get(&key)? {
            let (host, port) = split_host_port(&entry.target);
            let record = MxRecord::new(host, 0).with_port(port.unwrap_or(25));
            debug!(key, target = %entry.target, "resolved through override row");
            return Ok((Arc::new(vec![record]), true));
        }

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok((Arc::clone(&cached.records), true));
            }
        }

        if key.parse::<IpAddr>().is_ok() {
            return Ok((Arc::new(vec![MxRecord::new(key, 0)]), false));
        }

        let (mut records, ttl) = self.dns.lookup_mx(&key).await?;

        if records.len() == 1 && records[0].host == "." {
            return Err(ResolveError::NullMx(key));
        }

        if records.is_empty() {
            // implicit MX: the domain itself, if it has any address at all
            if self.dns.lookup_ips(&key).await?.is_empty() {
                return Err(ResolveError::NoServers(key));
            }
            records = vec![MxRecord::new(key.clone(), 0)];
        }

        order_by_preference(&mut records);

        let records = Arc::new(records);
        let cache_ttl = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(ttl).clamp(self.config.min_cache_ttl_secs, self.config.max_cache_ttl_secs)
        });
        self.cache.insert(
            key,
            CachedMx {
                records: Arc::clone(&records),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        Ok((records, false))
    }

    /// Adds or replaces an override row.
    ///
    /// # Errors
    /// If the table cannot be written.
    pub fn set_override(&self, entry: OverrideEntry) -> Result<(), StoreError> {
        self.store.set(entry)
    }

    /// # Errors
    /// If the table cannot be written.
    pub fn delete_override(&self, key: &str) -> Result<bool, StoreError> {
        self.store.delete(key)
    }

    /// # Errors
    /// If the table cannot be read.
    pub fn get_override(&self, key: &str) -> Result<Option<OverrideEntry>, StoreError> {
        self.store.get(key)
    }

    /// # Errors
    /// If the table cannot be read.
    pub fn list_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        self.store.list()
    }
}

/// Sorts by preference and shuffles within each equal-preference group, so
/// load spreads across equally-preferred exchangers.
fn order_by_preference(records: &mut [MxRecord]) {
    records.sort_by_key(|record| record.preference);

    let mut rng = rand::rng();
    let mut start = 0;
    while start < records.len() {
        let preference = records[start].preference;
        let end = records[start..]
            .iter()
            .position(|record| record.preference != preference)
            .map_or(records.len(), |offset| start + offset);
        records[start..end].shuffle(&mut rng);
        start = end;
    }
}

/// Splits an override target into host and optional port, understanding
/// `host`, `host:port`, bare IPv6 and `[v6]:port` forms.
pub(crate) fn split_host_port(target: &str) -> (String, Option<u16>) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_owned(), port);
        }
    }

    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if !host.contains(':') {
                return (host.to_owned(), Some(port));
            }
        }
    }

    (target.to_owned(), None)
}
