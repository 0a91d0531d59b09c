//! Certificate lifecycle management for web virtual hosts.
//!
//! Each run lists the configured virtual hosts, keeps the domains that
//! actually resolve to our web endpoint, and for each of them either leaves
//! the stored certificate alone, renews it when it gets close to expiry, or
//! acquires a first certificate from an ACME authority. Certificates are
//! written atomically to `<cert_dir>/<domain>.crt`.
//!
//! Every external dependency sits behind a trait ([`VhostSource`],
//! [`DnsLookup`], [`CertificateAuthority`]) so the decision logic in
//! [`Engine`] can run without network access:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vhost_certbot::CertBotConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CertBotConfig::builder()
//!     .workdir("/var/lib/lets-encrypt")
//!     .vhosts_file("/etc/vhosts.json")
//!     .reference_host("www.example.org")
//!     .nameservers(vec!["8.8.8.8".parse()?, "8.8.4.4".parse()?])
//!     .renew_expires_in(Duration::from_secs(45 * 24 * 3600))
//!     .issue_timeout(Duration::from_secs(120))
//!     .build();
//! let summary = config.build_bot().await?.run().await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub use acme_client::AcmeClient;
pub use authority::{make_csr, CertificateAuthority, IssueError};
pub use bot::{run_once, CertBot, CertBotConfig, RunSummary};
pub use engine::{Engine, Outcome};
pub use rate_limit::{registrable_domain, RateLimitTracker};
pub use resolver::{DnsLookup, DomainResolver, HickoryLookup, Lookup};
pub use store::{CertStore, StoreError};
pub use vhosts::{all_domains, VhostFile, VhostSource, VirtualHost};
pub use workdir::WorkDir;

mod acme_client;
mod authority;
mod bot;
mod engine;
mod rate_limit;
mod resolver;
mod store;
mod vhosts;
mod workdir;

#[cfg(test)]
mod test_utils;
