use std::{
    collections::BTreeSet,
    fmt,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use fs_err::{os::unix::fs::OpenOptionsExt, OpenOptions};
use rcgen::KeyPair;
use tracing::{error, info};

use crate::{
    acme_client::AcmeClient,
    authority::CertificateAuthority,
    engine::{Engine, Outcome},
    resolver::{DnsLookup, DomainResolver, HickoryLookup},
    store::CertStore,
    vhosts::{all_domains, VhostFile, VhostSource},
    WorkDir,
};

#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct CertBotConfig {
    workdir: PathBuf,
    vhosts_file: PathBuf,
    /// Hostname whose address every eligible domain must resolve to.
    reference_host: String,
    nameservers: Vec<std::net::IpAddr>,
    renew_expires_in: Duration,
    issue_timeout: Duration,
    #[builder(default)]
    dry_run: bool,
    renewed_hook: Option<String>,
}

impl CertBotConfig {
    pub async fn build_bot(&self) -> Result<CertBot> {
        CertBot::build(self.clone()).await
    }

    pub fn workdir(&self) -> WorkDir {
        WorkDir::new(&self.workdir)
    }

    /// Prepare the work directory: register an ACME account and generate the
    /// vhost key unless they already exist. Existing files are never touched.
    pub async fn init(&self, acme_url: &str) -> Result<()> {
        let workdir = self.workdir();
        fs_err::create_dir_all(workdir.cert_dir()).context("failed to create cert directory")?;
        fs_err::create_dir_all(workdir.acme_challenge_dir())
            .context("failed to create challenge directory")?;

        let credentials_path = workdir.account_credentials_path();
        if credentials_path.exists() {
            info!("using existing ACME account");
        } else {
            info!("creating new ACME account");
            let client = AcmeClient::new_account(
                acme_url,
                workdir.acme_challenge_dir(),
                self.issue_timeout,
            )
            .await?;
            let credentials = client
                .dump_credentials()
                .context("failed to dump credentials")?;
            write_secret(&credentials_path, credentials.as_bytes())?;
            info!("created new ACME account: {}", client.account_id());
        }

        let key_path = workdir.vhost_key_path();
        if key_path.exists() {
            info!("using existing vhost key");
        } else {
            info!("generating vhost key");
            let key = KeyPair::generate().context("failed to generate key")?;
            write_secret(&key_path, key.serialize_pem().as_bytes())?;
        }
        Ok(())
    }
}

/// Create `path` readable by the owner only. Fails if it already exists.
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Counts collected over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub eligible: usize,
    pub with_cert: usize,
    pub need_cert: usize,
    pub renewed: usize,
    pub acquired: usize,
    pub rate_limited: usize,
}

impl RunSummary {
    pub fn changed(&self) -> bool {
        self.renewed + self.acquired > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total domains: {}", self.total)?;
        writeln!(f, "eligible domains: {}", self.eligible)?;
        writeln!(f, "domains with certificates: {}", self.with_cert)?;
        writeln!(f, "domains needing certificates: {}", self.need_cert)?;
        write!(
            f,
            "renewed: {}, acquired: {}, rate limited: {}",
            self.renewed, self.acquired, self.rate_limited
        )
    }
}

pub struct CertBot {
    acme_client: AcmeClient,
    config: CertBotConfig,
}

impl CertBot {
    /// Build a new `CertBot` from a `CertBotConfig`, loading the existing
    /// account credentials.
    pub async fn build(config: CertBotConfig) -> Result<Self> {
        let workdir = config.workdir();
        let credentials = workdir.read_account_credentials()?;
        let acme_client = AcmeClient::load(
            &credentials,
            workdir.acme_challenge_dir(),
            config.issue_timeout,
        )
        .await
        .context("failed to load ACME account")?;
        Ok(Self {
            acme_client,
            config,
        })
    }

    /// Get the ACME account ID.
    pub fn account_id(&self) -> &str {
        self.acme_client.account_id()
    }

    /// Run once over every virtual host.
    pub async fn run(&self) -> Result<RunSummary> {
        let workdir = self.config.workdir();
        let csr_key_pem = workdir.read_vhost_key()?;
        let store = CertStore::new(workdir.cert_dir());
        let renew_threshold = time::Duration::try_from(self.config.renew_expires_in)
            .context("renewal threshold out of range")?;
        let mut engine = Engine::new(&self.acme_client, &store, csr_key_pem, renew_threshold)
            .dry_run(self.config.dry_run);
        let resolver = DomainResolver::new(
            HickoryLookup::new(&self.config.nameservers),
            &self.config.reference_host,
        );
        let vhosts = VhostFile::new(&self.config.vhosts_file);

        let mut summary = RunSummary::default();
        let result = run_once(&vhosts, &resolver, &store, &mut engine, &mut summary).await;
        // Certificates written before a fatal error are live on disk too.
        run_renewed_hook(&self.config, &summary);
        result?;
        Ok(summary)
    }
}

/// Run the configured hook if the run replaced any certificate.
fn run_renewed_hook(config: &CertBotConfig, summary: &RunSummary) {
    if config.dry_run || !summary.changed() {
        return;
    }
    let Some(hook) = &config.renewed_hook else {
        return;
    };
    info!("running renewed hook");
    let result = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(hook)
        .status();
    match result {
        Ok(status) => {
            if !status.success() {
                error!("renewed hook failed with status: {status}");
            }
        }
        Err(err) => {
            error!("failed to run renewed hook: {err:?}");
        }
    }
}

/// Gather, filter, partition and process every domain once, sequentially.
///
/// Counts go into `summary` as they happen. On a fatal error the run stops,
/// and `summary` still reflects the certificates written before that point,
/// which stay in place.
pub async fn run_once<V, L, A>(
    vhosts: &V,
    resolver: &DomainResolver<L>,
    store: &CertStore,
    engine: &mut Engine<'_, A>,
    summary: &mut RunSummary,
) -> Result<()>
where
    V: VhostSource,
    L: DnsLookup,
    A: CertificateAuthority,
{
    let candidates = all_domains(&vhosts.get_vhosts().context("failed to list vhosts")?);
    info!("found {} domains", candidates.len());
    let eligible = resolver.eligible_domains(&candidates).await?;
    info!("{} domains point at us", eligible.len());

    let mut have_cert = BTreeSet::new();
    let mut need_cert = BTreeSet::new();
    for domain in &eligible {
        if store.exists(domain)? {
            have_cert.insert(domain.as_str());
        } else {
            need_cert.insert(domain.as_str());
        }
    }

    *summary = RunSummary {
        total: candidates.len(),
        eligible: eligible.len(),
        with_cert: have_cert.len(),
        need_cert: need_cert.len(),
        ..Default::default()
    };

    for domain in have_cert.iter().chain(need_cert.iter()) {
        match engine.process(domain).await? {
            Outcome::Renewed => {
                println!("renewed certificate for {domain}");
                summary.renewed += 1;
            }
            Outcome::Acquired => {
                println!("acquired certificate for {domain}");
                summary.acquired += 1;
            }
            Outcome::RateLimited | Outcome::SkippedRateLimited => summary.rate_limited += 1,
            Outcome::WouldRenew => println!("would renew certificate for {domain}"),
            Outcome::WouldAcquire => println!("would acquire certificate for {domain}"),
            Outcome::UpToDate => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
