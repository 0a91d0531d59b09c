use anyhow::{anyhow, Result};
use rcgen::{CertificateParams, KeyPair};
use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    sync::Mutex,
};
use time::{Duration, OffsetDateTime};

use crate::{
    authority::{CertificateAuthority, IssueError},
    resolver::{DnsLookup, Lookup},
};

/// Self-signed certificate for `domain` expiring `days` from now.
pub fn make_cert_pem(domain: &str, days: i64) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(days);
    params.self_signed(&key).unwrap().pem()
}

pub fn make_key_pem() -> String {
    KeyPair::generate().unwrap().serialize_pem()
}

/// Fixed answers keyed by hostname. Unknown hosts do not resolve.
#[derive(Default)]
pub struct StaticLookup {
    answers: BTreeMap<String, Option<Vec<Ipv4Addr>>>,
}

impl StaticLookup {
    pub fn with(mut self, host: &str, addrs: &[[u8; 4]]) -> Self {
        let addrs = addrs.iter().map(|octets| Ipv4Addr::from(*octets)).collect();
        self.answers.insert(host.to_string(), Some(addrs));
        self
    }

    /// Lookups for `host` fail outright, like a SERVFAIL or timeout.
    pub fn failing(mut self, host: &str) -> Self {
        self.answers.insert(host.to_string(), None);
        self
    }
}

impl DnsLookup for StaticLookup {
    async fn lookup_ipv4(&self, host: &str) -> Result<Lookup> {
        match self.answers.get(host) {
            Some(Some(addrs)) => Ok(Lookup::Found(addrs.clone())),
            Some(None) => Err(anyhow!("failed to resolve {host}: request timed out")),
            None => Ok(Lookup::NotFound),
        }
    }
}

/// Authority that signs everything for 90 days unless told otherwise, and
/// records every request it receives.
#[derive(Default)]
pub struct FakeAuthority {
    calls: Mutex<Vec<String>>,
    rate_limited: BTreeMap<String, String>,
    failing: BTreeMap<String, String>,
}

impl FakeAuthority {
    /// Domains ending in `suffix` are refused with a rate limit naming `reported`.
    pub fn rate_limiting(mut self, suffix: &str, reported: &str) -> Self {
        self.rate_limited
            .insert(suffix.to_string(), reported.to_string());
        self
    }

    pub fn failing(mut self, domain: &str, detail: &str) -> Self {
        self.failing.insert(domain.to_string(), detail.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CertificateAuthority for FakeAuthority {
    async fn sign(&self, domain: &str, csr_der: &[u8]) -> Result<String, IssueError> {
        assert!(!csr_der.is_empty());
        self.calls.lock().unwrap().push(domain.to_string());
        if let Some(detail) = self.failing.get(domain) {
            return Err(IssueError::from_authority_message(detail));
        }
        for (suffix, reported) in &self.rate_limited {
            if domain.ends_with(suffix.as_str()) {
                return Err(IssueError::from_authority_message(&format!(
                    "Error creating new cert :: too many certificates already issued for: {reported}"
                )));
            }
        }
        Ok(make_cert_pem(domain, 90))
    }
}
