//! Locating the hosts responsible for a domain (RFC 5321 section 5.1).

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider};
use mireka_common::{internal, status::EnhancedStatus};
use rand::seq::SliceRandom;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Domain {0} does not exist")]
    DomainNotFound(String),

    #[error("Host {0} has no address record")]
    NoAddress(String),

    #[error("DNS lookup of {name} failed: {reason}")]
    LookupFailed { name: String, reason: String },
}

impl DnsError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed { .. })
    }

    #[must_use]
    pub fn status(&self) -> EnhancedStatus {
        let status = match self {
            Self::DomainNotFound(_) => EnhancedStatus::BAD_DESTINATION_SYSTEM_ADDRESS,
            Self::NoAddress(_) => EnhancedStatus::PERMANENT_UNABLE_TO_ROUTE,
            Self::LookupFailed { .. } => EnhancedStatus::DIRECTORY_SERVER_FAILURE,
        };
        status.with_message(self.to_string())
    }
}

/// The DNS queries needed to send mail directly to a domain.
#[async_trait]
pub trait MailExchangerResolver: Send + Sync {
    /// Host names accepting mail for `domain`, most preferred first. A domain
    /// without MX records is its own mail exchanger.
    async fn mail_exchangers(&self, domain: &str) -> Result<Arc<Vec<String>>, DnsError>;

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// How long MX answers are reused.
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn cache_ttl_secs() -> u64 {
        300
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            cache_ttl_secs: defaults::cache_ttl_secs(),
        }
    }
}

#[derive(Debug)]
struct CachedExchangers {
    hosts: Arc<Vec<String>>,
    expires_at: Instant,
}

/// Resolver using the system's DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedExchangers>,
    cache_ttl: Duration,
}

impl DnsResolver {
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| lookup_failed("system configuration", &err))?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        })
    }

    async fn query_mail_exchangers(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        (mx.preference(), host.trim_end_matches('.').to_string())
                    })
                    .collect();

                if records.is_empty() {
                    internal!(level = DEBUG, "Empty MX answer for {domain}, using the domain itself");
                    return Ok(vec![domain.to_string()]);
                }

                // Equal preferences are tried in random order.
                records.shuffle(&mut rand::rng());
                records.sort_by_key(|(preference, _)| *preference);
                Ok(records.into_iter().map(|(_, host)| host).collect())
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                internal!(level = DEBUG, "{domain} has no MX records, using the domain itself");
                Ok(vec![domain.to_string()])
            }
            Err(err) => Err(lookup_failed(domain, &err)),
        }
    }
}

#[async_trait]
impl MailExchangerResolver for DnsResolver {
    async fn mail_exchangers(&self, domain: &str) -> Result<Arc<Vec<String>>, DnsError> {
        let key = domain.to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > Instant::now()
        {
            return Ok(Arc::clone(&cached.hosts));
        }

        let hosts = Arc::new(self.query_mail_exchangers(domain).await?);
        internal!(level = DEBUG, "Mail exchangers of {domain}: {hosts:?}");
        self.cache.insert(
            key,
            CachedExchangers {
                hosts: Arc::clone(&hosts),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Ok(hosts)
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addresses: Vec<IpAddr> = lookup.iter().collect();
                if addresses.is_empty() {
                    Err(DnsError::NoAddress(host.to_string()))
                } else {
                    Ok(addresses)
                }
            }
            Err(err) if err.is_nx_domain() || err.is_no_records_found() => {
                Err(DnsError::NoAddress(host.to_string()))
            }
            Err(err) => Err(lookup_failed(host, &err)),
        }
    }
}

fn lookup_failed(name: &str, err: &ResolveError) -> DnsError {
    internal!(level = WARN, "DNS lookup of {name} failed: {err}");
    DnsError::LookupFailed {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

/// Answers from fixed tables, for configurations and tests without DNS.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    exchangers: AHashMap<String, Arc<Vec<String>>>,
    addresses: AHashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn with_exchangers(mut self, domain: &str, hosts: &[&str]) -> Self {
        self.exchangers.insert(
            domain.to_ascii_lowercase(),
            Arc::new(hosts.iter().map(ToString::to_string).collect()),
        );
        self
    }

    #[must_use]
    pub fn with_address(mut self, host: &str, address: IpAddr) -> Self {
        self.addresses
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(address);
        self
    }
}

#[async_trait]
impl MailExchangerResolver for StaticResolver {
    async fn mail_exchangers(&self, domain: &str) -> Result<Arc<Vec<String>>, DnsError> {
        let key = domain.to_ascii_lowercase();
        if let Some(hosts) = self.exchangers.get(&key) {
            return Ok(Arc::clone(hosts));
        }
        if self.addresses.contains_key(&key) {
            return Ok(Arc::new(vec![domain.to_string()]));
        }
        Err(DnsError::DomainNotFound(domain.to_string()))
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.addresses
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DnsError::NoAddress(host.to_string()))
    }
}
