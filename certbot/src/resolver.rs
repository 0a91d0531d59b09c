use anyhow::{bail, Context, Result};
use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr},
};
use tracing::{debug, info, warn};

/// Result of an A lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<Ipv4Addr>),
    /// NXDOMAIN or an empty answer.
    NotFound,
}

#[allow(async_fn_in_trait)]
pub trait DnsLookup {
    async fn lookup_ipv4(&self, host: &str) -> Result<Lookup>;
}

/// DNS lookups against an explicit set of nameservers, bypassing the host's
/// resolver configuration and any local overrides.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }
}

impl DnsLookup for HickoryLookup {
    async fn lookup_ipv4(&self, host: &str) -> Result<Lookup> {
        match self.resolver.ipv4_lookup(host).await {
            Ok(answer) => Ok(Lookup::Found(answer.iter().map(|a| a.0).collect())),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Lookup::NotFound),
                _ => Err(err).with_context(|| format!("failed to resolve {host}")),
            },
        }
    }
}

/// Decides which domains are actually pointed at us.
pub struct DomainResolver<L> {
    lookup: L,
    reference_host: String,
}

impl<L: DnsLookup> DomainResolver<L> {
    pub fn new(lookup: L, reference_host: impl Into<String>) -> Self {
        Self {
            lookup,
            reference_host: reference_host.into(),
        }
    }

    /// Addresses of the canonical web endpoint. A round-robin reference host
    /// yields all of its A records.
    pub async fn reference_addresses(&self) -> Result<BTreeSet<Ipv4Addr>> {
        let lookup = self
            .lookup
            .lookup_ipv4(&self.reference_host)
            .await
            .context("failed to resolve reference host")?;
        match lookup {
            Lookup::Found(addrs) if !addrs.is_empty() => Ok(addrs.into_iter().collect()),
            Lookup::Found(_) => bail!("reference host {} has no A record", self.reference_host),
            Lookup::NotFound => bail!("reference host {} does not resolve", self.reference_host),
        }
    }

    /// Filters `candidates` down to the domains pointed at us: at least one A
    /// record, and every record is one of the reference host's addresses.
    ///
    /// A candidate that does not resolve, or whose lookup fails, is dropped
    /// without affecting the others.
    pub async fn eligible_domains(
        &self,
        candidates: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let reference = self.reference_addresses().await?;
        debug!("{} resolves to {reference:?}", self.reference_host);

        let mut eligible = BTreeSet::new();
        for domain in candidates {
            let addrs = match self.lookup.lookup_ipv4(domain).await {
                Ok(Lookup::Found(addrs)) => addrs,
                Ok(Lookup::NotFound) => {
                    debug!("{domain} does not resolve, skipping");
                    continue;
                }
                Err(err) => {
                    warn!("{err:#}, skipping");
                    continue;
                }
            };
            if !addrs.is_empty() && addrs.iter().all(|addr| reference.contains(addr)) {
                eligible.insert(domain.clone());
            } else {
                info!("{domain} resolves to {addrs:?}, not within {reference:?}, skipping");
            }
        }
        Ok(eligible)
    }
}
