use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use toml_edit::ser::to_document;
use tracing::debug;
use vhost_certbot::CertBotConfig;

#[derive(Subcommand)]
enum Command {
    /// Create the ACME account and vhost key if they do not exist yet
    Init,
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

/// Acquire and renew TLS certificates for web virtual hosts.
///
/// Without a subcommand, runs once over every virtual host and exits.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "vhost-certbot.toml")]
    config: PathBuf,
    /// Make every decision but do not request or write any certificate
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,
    /// Print progress and diagnostic output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Directory holding the account, the vhost key, certs/ and the challenge webroot
    workdir: PathBuf,
    /// ACME directory URL, used by `init` to register the account
    acme_url: String,
    /// JSON file mapping each primary domain to {"aliases": [...]}
    vhosts_file: PathBuf,
    /// Canonical web endpoint; eligible domains must resolve to its address
    reference_host: String,
    /// Nameservers used for every lookup instead of the system resolver
    nameservers: Vec<IpAddr>,
    /// Number of days before expiration to trigger renewal
    renew_days_before: u64,
    /// Timeout in seconds for a single certificate request
    issue_timeout: u64,
    /// Command to run after any certificate was acquired or renewed
    #[serde(default)]
    renewed_hook: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: "/var/lib/lets-encrypt".into(),
            acme_url: "https://acme-v02.api.letsencrypt.org/directory".into(),
            vhosts_file: "/etc/vhost-certbot/vhosts.json".into(),
            reference_host: "www.example.org".into(),
            nameservers: vec![[8, 8, 8, 8].into(), [8, 8, 4, 4].into()],
            renew_days_before: 45,
            issue_timeout: 120,
            renewed_hook: None,
        }
    }
}

impl Config {
    fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml_edit::de::from_str(&content).context("invalid configuration")
    }

    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = to_document(self)?;

        for (mut key, _value) in doc.iter_mut() {
            let Ok(docstring) = Self::get_field_docs(key.get()) else {
                continue;
            };
            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            key.leaf_decor_mut().set_prefix(comment);
        }
        Ok(doc.to_string())
    }

    fn bot_config(self, dry_run: bool) -> Result<CertBotConfig> {
        let renew_secs = self
            .renew_days_before
            .checked_mul(24 * 60 * 60)
            .with_context(|| format!("renew_days_before too large: {}", self.renew_days_before))?;
        Ok(CertBotConfig::builder()
            .workdir(self.workdir)
            .vhosts_file(self.vhosts_file)
            .reference_host(self.reference_host)
            .nameservers(self.nameservers)
            .renew_expires_in(Duration::from_secs(renew_secs))
            .issue_timeout(Duration::from_secs(self.issue_timeout))
            .dry_run(dry_run)
            .maybe_renewed_hook(self.renewed_hook)
            .build())
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        None => {
            let config = Config::load(&args.config).context("failed to load configuration")?;
            let bot = config
                .bot_config(args.dry_run)?
                .build_bot()
                .await
                .context("failed to build bot")?;
            debug!("using ACME account {}", bot.account_id());
            let summary = bot.run().await?;
            println!("{summary}");
        }
        Some(Command::Init) => {
            let config = Config::load(&args.config).context("failed to load configuration")?;
            let acme_url = config.acme_url.clone();
            config.bot_config(args.dry_run)?.init(&acme_url).await?;
        }
        Some(Command::Cfg { write_to }) => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{toml_str}"),
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let default_level = if args.verbose { "info" } else { "warn" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }
    let _ = rustls::crypto::ring::default_provider().install_default();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[!] {err:?}");
            ExitCode::FAILURE
        }
    }
}
