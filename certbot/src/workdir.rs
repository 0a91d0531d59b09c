use anyhow::{Context, Result};
use fs_err as fs;
use std::path::{Path, PathBuf};

/// Fixed on-disk layout used by the bot.
///
/// Everything except `certs/` and the challenge directory is read-only to the
/// renewal run; `init` is the only place that creates the account and key.
#[derive(Debug, Clone)]
pub struct WorkDir {
    workdir: PathBuf,
}

impl WorkDir {
    pub fn new(workdir: impl AsRef<Path>) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn account_credentials_path(&self) -> PathBuf {
        self.workdir.join("account.json")
    }

    /// Private key shared by every vhost CSR.
    pub fn vhost_key_path(&self) -> PathBuf {
        self.workdir.join("vhost.key")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.workdir.join("certs")
    }

    /// Webroot directory served at `/.well-known/acme-challenge/` for HTTP-01.
    pub fn acme_challenge_dir(&self) -> PathBuf {
        self.workdir.join(".well-known").join("acme-challenge")
    }

    pub fn read_vhost_key(&self) -> Result<String> {
        fs::read_to_string(self.vhost_key_path()).context("failed to read vhost key")
    }

    pub fn read_account_credentials(&self) -> Result<String> {
        fs::read_to_string(self.account_credentials_path())
            .context("failed to read account credentials, run `init` first")
    }
}
