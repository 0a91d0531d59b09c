use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, info, warn};

use crate::{
    authority::{make_csr, CertificateAuthority, IssueError},
    rate_limit::{registrable_domain, RateLimitTracker},
    store::{self, check_hostname, CertStore},
};

/// What happened to a single domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Certificate exists and is outside the renewal window.
    UpToDate,
    Renewed,
    Acquired,
    /// The authority refused issuance for the domain's registrable domain.
    RateLimited,
    /// Not attempted because the registrable domain was already refused this run.
    SkippedRateLimited,
    WouldRenew,
    WouldAcquire,
}

/// Per domain decision between skip, renew and acquire.
///
/// One engine serves one run. It owns the run's rate limit state, so a fresh
/// engine always starts with nothing limited.
pub struct Engine<'a, A> {
    authority: &'a A,
    store: &'a CertStore,
    csr_key_pem: String,
    renew_threshold: time::Duration,
    dry_run: bool,
    rate_limits: RateLimitTracker,
}

impl<'a, A: CertificateAuthority> Engine<'a, A> {
    pub fn new(
        authority: &'a A,
        store: &'a CertStore,
        csr_key_pem: impl Into<String>,
        renew_threshold: time::Duration,
    ) -> Self {
        Self {
            authority,
            store,
            csr_key_pem: csr_key_pem.into(),
            renew_threshold,
            dry_run: false,
            rate_limits: RateLimitTracker::new(),
        }
    }

    /// Decide and log, but never call the authority or touch the store.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitTracker) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    pub async fn process(&mut self, domain: &str) -> Result<Outcome> {
        check_hostname(domain)?;
        if self.store.exists(domain)? {
            self.renew_if_needed(domain).await
        } else {
            self.acquire(domain).await
        }
    }

    async fn renew_if_needed(&mut self, domain: &str) -> Result<Outcome> {
        let expires_at = self.store.expiration(domain)?;
        let remaining = expires_at - time::OffsetDateTime::now_utc();
        if remaining > self.renew_threshold {
            debug!("{domain} expires in {} days", remaining.whole_days());
            return Ok(Outcome::UpToDate);
        }
        info!(
            "{domain} expires in {} days, renewing",
            remaining.whole_days()
        );
        if self.dry_run {
            return Ok(Outcome::WouldRenew);
        }
        let cert = self
            .sign(domain)
            .await
            .with_context(|| format!("failed to renew certificate for {domain}"))?;
        let new_expires_at = store::not_after(&cert)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("authority returned an unreadable certificate for {domain}"))?;
        ensure!(
            new_expires_at > expires_at,
            "renewed certificate for {domain} expires at {new_expires_at}, not after {expires_at}"
        );
        self.store.write(domain, cert.as_bytes())?;
        Ok(Outcome::Renewed)
    }

    async fn acquire(&mut self, domain: &str) -> Result<Outcome> {
        let base = registrable_domain(domain);
        if self.rate_limits.is_limited(&base) {
            info!("{base} is rate limited, skipping {domain}");
            return Ok(Outcome::SkippedRateLimited);
        }
        info!("{domain} has no certificate, acquiring");
        if self.dry_run {
            return Ok(Outcome::WouldAcquire);
        }
        match self.sign(domain).await {
            Ok(cert) => {
                store::not_after(&cert).map_err(anyhow::Error::msg).with_context(|| {
                    format!("authority returned an unreadable certificate for {domain}")
                })?;
                self.store.write(domain, cert.as_bytes())?;
                Ok(Outcome::Acquired)
            }
            Err(IssueError::RateLimited(limited)) => {
                if limited != base {
                    bail!(
                        "authority rate limited {limited} while acquiring {domain}, expected {base}"
                    );
                }
                warn!("too many certificates already issued for {base}, skipping its domains");
                self.rate_limits.record_limited(base);
                Ok(Outcome::RateLimited)
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to acquire certificate for {domain}"))
            }
        }
    }

    async fn sign(&self, domain: &str) -> Result<String, IssueError> {
        let csr = make_csr(&self.csr_key_pem, domain)
            .map_err(|err| IssueError::Other(format!("{err:#}")))?;
        self.authority.sign(domain, &csr).await
    }
}
