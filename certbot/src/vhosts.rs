use anyhow::{Context, Result};
use fs_err as fs;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

/// A web virtual host: its primary domain and any aliases served alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub primary_domain: String,
    pub aliases: BTreeSet<String>,
}

impl VirtualHost {
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_domain.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Where the list of virtual hosts comes from.
pub trait VhostSource {
    fn get_vhosts(&self) -> Result<Vec<VirtualHost>>;
}

/// Every primary domain and alias across `vhosts`.
pub fn all_domains(vhosts: &[VirtualHost]) -> BTreeSet<String> {
    vhosts
        .iter()
        .flat_map(VirtualHost::domains)
        .map(str::to_string)
        .collect()
}

/// Reads virtual hosts from a JSON object keyed by primary domain:
///
/// ```json
/// { "www.example.org": { "aliases": ["example.org"] } }
/// ```
#[derive(Debug, Clone)]
pub struct VhostFile {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct VhostEntry {
    #[serde(default)]
    aliases: BTreeSet<String>,
}

impl VhostFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl VhostSource for VhostFile {
    fn get_vhosts(&self) -> Result<Vec<VirtualHost>> {
        let content = fs::read_to_string(&self.path).context("failed to read vhosts file")?;
        parse_vhosts(&content)
    }
}

pub(crate) fn parse_vhosts(content: &str) -> Result<Vec<VirtualHost>> {
    let entries: BTreeMap<String, VhostEntry> =
        serde_json::from_str(content).context("failed to parse vhosts file")?;
    Ok(entries
        .into_iter()
        .map(|(primary_domain, entry)| VirtualHost {
            primary_domain,
            aliases: entry.aliases,
        })
        .collect())
}

impl VhostSource for Vec<VirtualHost> {
    fn get_vhosts(&self) -> Result<Vec<VirtualHost>> {
        Ok(self.clone())
    }
}
