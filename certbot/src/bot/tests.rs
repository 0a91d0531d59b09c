use super::*;
use crate::{
    test_utils::{make_cert_pem, make_key_pem, FakeAuthority, StaticLookup},
    vhosts::VirtualHost,
};
use tempfile::TempDir;

fn vhosts() -> Vec<VirtualHost> {
    vec![
        VirtualHost {
            primary_domain: "a.example.org".into(),
            aliases: BTreeSet::from(["b.example.org".to_string()]),
        },
        VirtualHost {
            primary_domain: "c.example.org".into(),
            aliases: BTreeSet::new(),
        },
        VirtualHost {
            primary_domain: "gone.example.org".into(),
            aliases: BTreeSet::new(),
        },
    ]
}

fn resolver() -> DomainResolver<StaticLookup> {
    let lookup = StaticLookup::default()
        .with("web.example.org", &[[1, 2, 3, 4]])
        .with("a.example.org", &[[1, 2, 3, 4]])
        .with("b.example.org", &[[1, 2, 3, 4]])
        .with("c.example.org", &[[9, 9, 9, 9]]);
    DomainResolver::new(lookup, "web.example.org")
}

fn threshold() -> time::Duration {
    time::Duration::days(45)
}

#[tokio::test]
async fn test_run_acquires_then_is_idempotent() {
    tracing_subscriber::fmt::try_init().ok();

    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path());
    let key = make_key_pem();
    let authority = FakeAuthority::default();
    let resolver = resolver();

    let mut engine = Engine::new(&authority, &store, key.clone(), threshold());
    let mut first = RunSummary::default();
    run_once(&vhosts(), &resolver, &store, &mut engine, &mut first)
        .await
        .unwrap();
    insta::assert_snapshot!(first.to_string(), @r"
    total domains: 4
    eligible domains: 2
    domains with certificates: 0
    domains needing certificates: 2
    renewed: 0, acquired: 2, rate limited: 0
    ");
    assert!(first.changed());

    let mut engine = Engine::new(&authority, &store, key, threshold());
    let mut second = RunSummary::default();
    run_once(&vhosts(), &resolver, &store, &mut engine, &mut second)
        .await
        .unwrap();
    assert_eq!(
        second,
        RunSummary {
            total: 4,
            eligible: 2,
            with_cert: 2,
            need_cert: 0,
            ..Default::default()
        }
    );
    assert!(!second.changed());
    assert_eq!(authority.calls(), vec!["a.example.org", "b.example.org"]);
}

#[tokio::test]
async fn test_run_renews_and_skips_rate_limited() {
    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path());
    store
        .write("a.example.org", make_cert_pem("a.example.org", 10).as_bytes())
        .unwrap();
    let authority = FakeAuthority::default().rate_limiting("b.example.org", "example.org");
    let mut engine = Engine::new(&authority, &store, make_key_pem(), threshold());

    let mut summary = RunSummary::default();
    run_once(&vhosts(), &resolver(), &store, &mut engine, &mut summary)
        .await
        .unwrap();

    assert_eq!(summary.with_cert, 1);
    assert_eq!(summary.need_cert, 1);
    assert_eq!(summary.renewed, 1);
    assert_eq!(summary.rate_limited, 1);
    assert!(engine.rate_limits().is_limited("example.org"));
    assert!(!store.exists("b.example.org").unwrap());
}

#[tokio::test]
async fn test_fatal_error_keeps_earlier_writes() {
    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path());
    let authority = FakeAuthority::default().failing("b.example.org", "unexpected response");
    let mut engine = Engine::new(&authority, &store, make_key_pem(), threshold());

    let mut summary = RunSummary::default();
    let err = run_once(&vhosts(), &resolver(), &store, &mut engine, &mut summary)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("unexpected response"));
    assert!(store.exists("a.example.org").unwrap());
    assert!(store.expiration("a.example.org").is_ok());
    // The write before the failure is still counted.
    assert_eq!(summary.acquired, 1);
    assert!(summary.changed());
}

fn hook_config(dir: &Path, dry_run: bool) -> CertBotConfig {
    let marker = dir.join("hook-ran");
    CertBotConfig::builder()
        .workdir(dir)
        .vhosts_file(dir.join("vhosts.json"))
        .reference_host("web.example.org")
        .nameservers(vec![])
        .renew_expires_in(Duration::from_secs(45 * 24 * 3600))
        .issue_timeout(Duration::from_secs(1))
        .dry_run(dry_run)
        .renewed_hook(format!("touch '{}'", marker.display()))
        .build()
}

#[tokio::test]
async fn test_renewed_hook_runs_after_partial_failure() {
    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path().join("certs"));
    let authority = FakeAuthority::default().failing("b.example.org", "unexpected response");
    let mut engine = Engine::new(&authority, &store, make_key_pem(), threshold());
    let mut summary = RunSummary::default();
    run_once(&vhosts(), &resolver(), &store, &mut engine, &mut summary)
        .await
        .unwrap_err();

    run_renewed_hook(&hook_config(dir.path(), false), &summary);
    assert!(dir.path().join("hook-ran").exists());
}

#[test]
fn test_renewed_hook_needs_a_change() {
    let dir = TempDir::new().unwrap();
    run_renewed_hook(&hook_config(dir.path(), false), &RunSummary::default());
    assert!(!dir.path().join("hook-ran").exists());

    let changed = RunSummary {
        renewed: 1,
        ..Default::default()
    };
    run_renewed_hook(&hook_config(dir.path(), true), &changed);
    assert!(!dir.path().join("hook-ran").exists());
}

#[tokio::test]
async fn test_dry_run_reports_without_changes() {
    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path());
    let authority = FakeAuthority::default();
    let mut engine = Engine::new(&authority, &store, make_key_pem(), threshold()).dry_run(true);

    let mut summary = RunSummary::default();
    run_once(&vhosts(), &resolver(), &store, &mut engine, &mut summary)
        .await
        .unwrap();

    assert_eq!(summary.need_cert, 2);
    assert!(!summary.changed());
    assert!(authority.calls().is_empty());
    assert!(!store.exists("a.example.org").unwrap());
}

#[test]
fn test_config_builder() {
    let config = CertBotConfig::builder()
        .workdir("/var/lib/lets-encrypt")
        .vhosts_file("/etc/vhosts.json")
        .reference_host("web.example.org")
        .nameservers(vec!["8.8.8.8".parse().unwrap(), "8.8.4.4".parse().unwrap()])
        .renew_expires_in(Duration::from_secs(45 * 24 * 3600))
        .issue_timeout(Duration::from_secs(120))
        .build();
    assert!(!config.dry_run);
    assert!(config.renewed_hook.is_none());
    assert_eq!(
        config.workdir().cert_dir(),
        PathBuf::from("/var/lib/lets-encrypt/certs")
    );
}

#[test]
fn test_write_secret_refuses_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("account.json");
    write_secret(&path, b"first").unwrap();

    let err = write_secret(&path, b"second").unwrap_err();
    assert!(format!("{err:#}").contains(&path.display().to_string()));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
}

#[tokio::test]
async fn test_init_generates_missing_key_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let config = CertBotConfig::builder()
        .workdir(dir.path())
        .vhosts_file(dir.path().join("vhosts.json"))
        .reference_host("web.example.org")
        .nameservers(vec![])
        .renew_expires_in(Duration::from_secs(45 * 24 * 3600))
        .issue_timeout(Duration::from_secs(1))
        .build();
    let workdir = config.workdir();
    // An existing account is reused, so no authority is contacted.
    std::fs::write(workdir.account_credentials_path(), "{}").unwrap();

    config.init("http://127.0.0.1:1/directory").await.unwrap();

    let key = std::fs::read_to_string(workdir.vhost_key_path()).unwrap();
    assert!(KeyPair::from_pem(&key).is_ok());
    let mode = std::fs::metadata(workdir.vhost_key_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
    assert!(workdir.cert_dir().is_dir());
    assert!(workdir.acme_challenge_dir().is_dir());

    config.init("http://127.0.0.1:1/directory").await.unwrap();
    assert_eq!(std::fs::read_to_string(workdir.vhost_key_path()).unwrap(), key);
    assert_eq!(
        std::fs::read_to_string(workdir.account_credentials_path()).unwrap(),
        "{}"
    );
}
