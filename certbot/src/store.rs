use fs_err as fs;
use std::{
    fs::Permissions,
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use x509_parser::prelude::Pem;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed certificate for {domain}: {reason}")]
    MalformedCertificate { domain: String, reason: String },
    #[error("refusing to handle invalid hostname {0:?}")]
    InvalidDomain(String),
    #[error("failed to read certificate for {domain}")]
    Read {
        domain: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write certificate for {domain}")]
    Write {
        domain: String,
        #[source]
        source: io::Error,
    },
}

/// Certificates on disk, one `<domain>.crt` file per domain.
#[derive(Debug, Clone)]
pub struct CertStore {
    cert_dir: PathBuf,
}

impl CertStore {
    pub fn new(cert_dir: impl AsRef<Path>) -> Self {
        Self {
            cert_dir: cert_dir.as_ref().to_path_buf(),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn cert_path(&self, domain: &str) -> Result<PathBuf, StoreError> {
        check_hostname(domain)?;
        Ok(self.cert_dir.join(format!("{domain}.crt")))
    }

    pub fn exists(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.cert_path(domain)?.is_file())
    }

    pub fn read(&self, domain: &str) -> Result<String, StoreError> {
        fs::read_to_string(self.cert_path(domain)?).map_err(|source| StoreError::Read {
            domain: domain.to_string(),
            source,
        })
    }

    /// The `notAfter` of the stored certificate.
    pub fn expiration(&self, domain: &str) -> Result<OffsetDateTime, StoreError> {
        let cert_pem = self.read(domain)?;
        not_after(&cert_pem).map_err(|reason| StoreError::MalformedCertificate {
            domain: domain.to_string(),
            reason,
        })
    }

    pub fn time_remaining(&self, domain: &str) -> Result<time::Duration, StoreError> {
        Ok(self.expiration(domain)? - OffsetDateTime::now_utc())
    }

    /// Replace the certificate for `domain`.
    ///
    /// The content goes to a temporary file next to the target, is synced and
    /// made 0644, then renamed over `<domain>.crt`. Readers see either the old
    /// file or the new one, never a partial write. The temporary file is
    /// unlinked on drop if anything fails before the rename.
    pub fn write(&self, domain: &str, cert_pem: &[u8]) -> Result<(), StoreError> {
        let path = self.cert_path(domain)?;
        let write_err = |source| StoreError::Write {
            domain: domain.to_string(),
            source,
        };
        fs::create_dir_all(&self.cert_dir).map_err(write_err)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{domain}."))
            .suffix(".tmp")
            .tempfile_in(&self.cert_dir)
            .map_err(write_err)?;
        tmp.write_all(cert_pem).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .map_err(write_err)?;
        tmp.persist(&path).map_err(|err| write_err(err.error))?;
        // Make the rename itself durable.
        fs::File::open(&self.cert_dir)
            .and_then(|dir| dir.sync_all())
            .map_err(write_err)?;
        debug!("stored certificate {}", path.display());
        Ok(())
    }
}

/// Hostnames must stay within `[a-z0-9._-]`, without empty labels or a
/// trailing root dot. Anything else is a bug upstream and must never reach a
/// filesystem path or a CSR.
pub fn check_hostname(domain: &str) -> Result<(), StoreError> {
    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
        && domain
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.'));
    if !valid {
        return Err(StoreError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

pub(crate) fn not_after(cert_pem: &str) -> Result<OffsetDateTime, String> {
    let pem = Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .ok_or_else(|| "no certificate in pem".to_string())?
        .map_err(|err| format!("invalid pem: {err}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| format!("invalid x509 certificate: {err}"))?;
    Ok(cert.validity().not_after.to_datetime())
}
