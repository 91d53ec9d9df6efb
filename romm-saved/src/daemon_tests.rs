use super::*;
use std::collections::HashMap;
use tempfile::tempdir;
use wiremock::MockServer;

fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

const REQUIRED: [(&str, &str); 3] = [
    ("ROMM_URL", "https://romm.local"),
    ("ROMM_USER", "deck"),
    ("ROMM_PASS", "secret"),
];

#[test]
fn expands_tilde_against_home() {
    let home = Path::new("/home/deck");
    assert_eq!(expand_with_home("~", home), PathBuf::from("/home/deck"));
    assert_eq!(
        expand_with_home("~/saves", home),
        PathBuf::from("/home/deck/saves")
    );
    assert_eq!(
        expand_with_home("/mnt/sd/saves", home),
        PathBuf::from("/mnt/sd/saves")
    );
}

#[test]
fn parses_bool_and_number_values() {
    assert!(read_bool(Some("Yes".into()), false));
    assert!(read_bool(Some(" 1 ".into()), false));
    assert!(!read_bool(Some("off".into()), true));
    assert!(read_bool(None, true));
    assert_eq!(read_u64(Some("42".into()), 7), 42);
    assert_eq!(read_u64(Some("0".into()), 7), 7);
    assert_eq!(read_u64(Some("soon".into()), 7), 7);
    assert_eq!(read_u64(None, 7), 7);
}

#[test]
fn missing_credentials_are_reported_by_name() {
    let home = Path::new("/home/deck");
    let err = DaemonConfig::from_lookup(
        home,
        lookup_from(&[("ROMM_URL", "https://romm.local"), ("ROMM_USER", "deck")]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("ROMM_PASS"));

    let err = DaemonConfig::from_lookup(
        home,
        lookup_from(&[("ROMM_URL", "  "), ("ROMM_USER", "deck"), ("ROMM_PASS", "x")]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("ROMM_URL"));
}

#[test]
fn invalid_server_url_is_rejected() {
    let err = DaemonConfig::from_lookup(
        Path::new("/home/deck"),
        lookup_from(&[
            ("ROMM_URL", "romm.local"),
            ("ROMM_USER", "deck"),
            ("ROMM_PASS", "secret"),
        ]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("not a valid URL"));
}

#[test]
fn defaults_apply_when_optional_values_are_absent() {
    let home = Path::new("/home/deck");
    let config = DaemonConfig::from_lookup(home, lookup_from(&REQUIRED)).unwrap();

    assert_eq!(
        config.state_file,
        PathBuf::from("/home/deck/homebrew/settings/romm-deck/state.json")
    );
    assert!(matches!(config.saves_root, SavesRoot::RetroDeck { .. }));
    assert_eq!(config.database_path, None);
    assert_eq!(config.emulator, "retroarch");
    assert_eq!(config.queue_retry_base, Duration::from_secs(300));
    assert_eq!(config.http_timeout, Duration::from_secs(30));
    assert!(!config.sync_on_start);
    assert!(!config.accept_invalid_certs);
    assert_eq!(config.drain_interval(), Duration::from_secs(300));
}

#[test]
fn drain_ticks_are_spread_by_jitter() {
    let config = DaemonConfig::from_lookup(Path::new("/home/deck"), lookup_from(&REQUIRED)).unwrap();
    let jitter = config.drain_jitter();

    assert_eq!(jitter.ceiling(0), Duration::from_secs(75));
    for _ in 0..32 {
        assert!(jitter.delay(0) <= Duration::from_secs(75));
    }
}

#[test]
fn overrides_are_applied() {
    let home = Path::new("/home/deck");
    let mut vars = REQUIRED.to_vec();
    vars.extend([
        ("ROMM_STATE_FILE", "~/state.json"),
        ("ROMM_SAVES_DIR", "~/saves"),
        ("ROMM_DATABASE", "/tmp/sync.db"),
        ("ROMM_EMULATOR", "mgba"),
        ("ROMM_QUEUE_RETRY_SECS", "5"),
        ("ROMM_HTTP_TIMEOUT_SECS", "10"),
        ("ROMM_SYNC_ON_START", "true"),
        ("ROMM_INSECURE_TLS", "1"),
    ]);

    let config = DaemonConfig::from_lookup(home, lookup_from(&vars)).unwrap();

    assert_eq!(config.state_file, PathBuf::from("/home/deck/state.json"));
    assert!(
        matches!(&config.saves_root, SavesRoot::Fixed(path) if path == Path::new("/home/deck/saves"))
    );
    assert_eq!(config.database_path, Some(PathBuf::from("/tmp/sync.db")));
    assert_eq!(config.emulator, "mgba");
    assert_eq!(config.http_timeout, Duration::from_secs(10));
    assert!(config.sync_on_start);
    assert!(config.accept_invalid_certs);
    assert_eq!(config.drain_interval(), Duration::from_secs(30));

    let engine_config = config.engine_config();
    assert_eq!(
        engine_config.queue_backoff.ceiling(0),
        Duration::from_secs(5)
    );
    assert_eq!(
        engine_config.queue_backoff.ceiling(1),
        Duration::from_secs(10)
    );
}

#[tokio::test]
async fn run_once_with_nothing_installed_reports_no_saves() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let home = dir.path();
    let db = home.join("data/save_sync.db");
    let url = server.uri();
    let config = DaemonConfig::from_lookup(
        home,
        lookup_from(&[
            ("ROMM_URL", url.as_str()),
            ("ROMM_USER", "deck"),
            ("ROMM_PASS", "secret"),
            ("ROMM_DATABASE", db.to_str().unwrap()),
            ("ROMM_SAVES_DIR", "~/saves"),
        ]),
    )
    .unwrap();

    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    let report = runtime.run_once().await.unwrap();

    assert_eq!(report.total, 0);
    assert_eq!(report.message, "No saves to sync");
    assert!(db.exists());
    assert!(runtime.engine().ensure_device().await.is_ok());
}
