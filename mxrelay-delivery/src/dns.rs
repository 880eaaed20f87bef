//! DNS resolution for next-hop selection.
//!
//! Implements MX record lookups with lock-free concurrent caching using DNS
//! record TTLs with configurable bounds.
//!
//! # Caching Strategy
//!
//! - **DNS TTL by default**: Uses the actual TTL from DNS records
//! - **Bounded TTLs**: Applies min (60s) and max (3600s) bounds to prevent extremes
//! - **Optional override**: `cache_ttl_secs` config can override DNS TTL for all entries
//! - **Lock-free**: `DashMap` provides concurrent access without mutex contention
//!
//! Unlike a full MTA this relay does not fall back to A/AAAA records: a domain
//! without MX records has no next hop.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The lookup succeeded but the domain publishes no MX records.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

/// Configuration for DNS resolver.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds (optional)
    /// If set, overrides the DNS record's TTL for all cached entries
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    /// Picks how long a lookup result stays cached given the smallest record TTL.
    fn cache_ttl(&self, dns_ttl: u32) -> Duration {
        let secs = self.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(self.min_cache_ttl_secs, self.max_cache_ttl_secs)
        });
        Duration::from_secs(secs)
    }
}

/// A mail exchanger as published in DNS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    /// The exchange name exactly as returned by the lookup (may end in `.`).
    pub host: String,
    /// MX preference (lower value = higher priority).
    pub priority: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, priority: u16) -> Self {
        Self { host, priority }
    }
}

/// Source of MX records for a domain.
///
/// Implementations return the exchanges sorted by preference, lowest first.
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DnsError::NoMailServers`] when the domain has no MX records and
    /// another [`DnsError`] when the lookup itself fails.
    async fn lookup_mx(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

/// Cached DNS result with expiration time.
#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// DNS resolver for next-hop lookups with concurrent caching.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Creates a new DNS resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new() -> Result<Self, DnsError> {
        Self::with_dns_config(DnsConfig::default())
    }

    /// Creates a new DNS resolver from the system configuration with custom caching settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be initialized.
    pub fn with_dns_config(dns_config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(dns_config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config: dns_config,
        })
    }

    /// Performs an uncached MX lookup.
    ///
    /// Returns the servers sorted by preference and the smallest record TTL.
    async fn lookup_uncached(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        // Bound the whole lookup, including the resolver's own retries.
        let deadline = Duration::from_secs(self.config.timeout_secs.saturating_mul(2));

        let lookup = tokio::time::timeout(deadline, self.resolver.mx_lookup(domain))
            .await
            .map_err(|_| DnsError::Timeout(domain.to_string()))?;

        let mx_lookup = match lookup {
            Ok(mx_lookup) => mx_lookup,
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records found for {domain}");
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                return Err(DnsError::LookupFailed(err));
            }
        };

        let min_ttl = mx_lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(300);

        let mut servers: Vec<MailServer> = mx_lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                let priority = mx.preference();
                debug!("Found MX record: {host} (priority: {priority})");
                MailServer::new(host, priority)
            })
            .collect();

        if servers.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        // Stable: equal preferences keep the order the resolver returned.
        servers.sort_by_key(|s| s.priority);

        Ok((servers, min_ttl))
    }
}

#[async_trait]
impl MxLookup for DnsResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        debug!("Resolving mail servers for domain: {domain}");

        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                debug!("Cache hit for {domain}, {} server(s)", cached.servers.len());
                return Ok(Arc::clone(&cached.servers));
            }
            debug!("Cache entry expired for {domain}");
        }

        let (servers, dns_ttl) = self.lookup_uncached(domain).await?;
        let servers = Arc::new(servers);
        let cache_ttl = self.config.cache_ttl(dns_ttl);

        self.cache.insert(
            domain.to_string(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + cache_ttl,
            },
        );

        debug!(
            "Cached result for {domain}, DNS TTL: {dns_ttl}s, cache TTL: {}s, {} server(s)",
            cache_ttl.as_secs(),
            servers.len()
        );

        Ok(servers)
    }
}
