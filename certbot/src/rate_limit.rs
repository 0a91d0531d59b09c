use std::collections::BTreeSet;

/// Registrable domains the authority refused to issue for during this run.
///
/// Lives for exactly one run. Nothing is persisted: the authority's window is
/// measured in days, while the next scheduled run is the retry.
#[derive(Debug, Default, Clone)]
pub struct RateLimitTracker {
    limited: BTreeSet<String>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_limited(&mut self, registrable_domain: impl Into<String>) {
        self.limited.insert(registrable_domain.into());
    }

    pub fn is_limited(&self, registrable_domain: &str) -> bool {
        self.limited.contains(registrable_domain)
    }

    pub fn limited(&self) -> impl Iterator<Item = &str> {
        self.limited.iter().map(String::as_str)
    }
}

/// Base domain the authority's issuance quota is accounted against.
///
/// Takes strictly the last two labels, so `www.example.co.uk` maps to `co.uk`.
/// This is wrong for multi-label public suffixes; swap in a public suffix list
/// lookup here if that ever matters.
pub fn registrable_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let labels: Vec<&str> = domain.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, sld, ..] => format!("{sld}.{tld}"),
        _ => domain.to_string(),
    }
}
