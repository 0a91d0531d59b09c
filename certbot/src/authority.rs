use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Failure of a signing request, split by what the caller should do about it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssueError {
    /// The authority refused because too many certificates were already
    /// issued for this registrable domain.
    #[error("too many certificates already issued for {0}")]
    RateLimited(String),
    /// Anything else. Carries the authority's diagnostic verbatim.
    #[error("{0}")]
    Other(String),
}

impl IssueError {
    /// Maps the raw text of an authority failure to a typed error.
    ///
    /// This is the only place that knows what a rate limit rejection looks
    /// like, e.g. `too many certificates already issued for: foo.org` or the
    /// newer `too many certificates (50) already issued for "foo.org" in the
    /// last 168h0m0s`.
    pub fn from_authority_message(message: &str) -> Self {
        static RATE_LIMITED: OnceLock<Regex> = OnceLock::new();
        let pattern = RATE_LIMITED.get_or_init(|| {
            Regex::new(
                r#"too many certificates (?:\(\d+\) )?already issued for:? "?([a-z0-9\-]+(?:\.[a-z0-9\-]+)+)"?"#,
            )
            .expect("valid rate limit pattern")
        });
        match pattern.captures(message) {
            Some(captures) => Self::RateLimited(captures[1].to_string()),
            None => Self::Other(message.to_string()),
        }
    }
}

/// The certificate signing capability.
#[allow(async_fn_in_trait)]
pub trait CertificateAuthority {
    /// Submits a DER encoded CSR for `domain` and returns the signed
    /// certificate chain as PEM.
    async fn sign(&self, domain: &str, csr_der: &[u8]) -> Result<String, IssueError>;
}

/// Builds a CSR with `domain` as its only subject alternative name.
pub fn make_csr(key_pem: &str, domain: &str) -> Result<Vec<u8>> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key = KeyPair::from_pem(key_pem).context("failed to parse private key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}
