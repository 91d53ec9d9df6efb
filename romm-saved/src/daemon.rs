use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use romm_core::{ClientOptions, RommClient};
use romm_integrations::ids::{DBUS_NAME_SAVE_SYNC, DBUS_OBJECT_PATH_SAVE_SYNC};
use tokio_util::sync::CancellationToken;
use url::Url;
use zbus::connection::Builder as ConnectionBuilder;
use zbus::object_server::SignalEmitter;

use crate::dbus_api::SaveSyncDbusService;
use crate::sync::backoff::Backoff;
use crate::sync::engine::{EngineConfig, SaveSyncEngine, SyncReport};
use crate::sync::local_saves::{RomRegistry, SaveLocator, SavesRoot};
use crate::sync::progress::{ProgressHub, SyncEvent};
use crate::sync::store::SyncStore;

const DEFAULT_STATE_FILE: &str = "~/homebrew/settings/romm-deck/state.json";
const DEFAULT_EMULATOR: &str = "retroarch";
const DEFAULT_QUEUE_RETRY_SECS: u64 = 300;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const MAX_QUEUE_RETRY_SECS: u64 = 6 * 60 * 60;
const MIN_DRAIN_INTERVAL_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub state_file: PathBuf,
    pub saves_root: SavesRoot,
    pub database_path: Option<PathBuf>,
    pub emulator: String,
    pub queue_retry_base: Duration,
    pub http_timeout: Duration,
    pub sync_on_start: bool,
    pub accept_invalid_certs: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(&home, |name| std::env::var(name).ok())
    }

    /// Builds the configuration from `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(
        home: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let server_url = required(&lookup, "ROMM_URL")?;
        Url::parse(&server_url).with_context(|| format!("ROMM_URL is not a valid URL: {server_url}"))?;
        let username = required(&lookup, "ROMM_USER")?;
        let password = required(&lookup, "ROMM_PASS")?;

        let state_file = expand_with_home(
            &lookup("ROMM_STATE_FILE").unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            home,
        );
        let saves_root = match non_empty(lookup("ROMM_SAVES_DIR")) {
            Some(dir) => SavesRoot::Fixed(expand_with_home(&dir, home)),
            None => SavesRoot::retrodeck(home),
        };
        let database_path = non_empty(lookup("ROMM_DATABASE")).map(|path| expand_with_home(&path, home));
        let emulator =
            non_empty(lookup("ROMM_EMULATOR")).unwrap_or_else(|| DEFAULT_EMULATOR.to_string());
        let queue_retry_base = Duration::from_secs(read_u64(
            lookup("ROMM_QUEUE_RETRY_SECS"),
            DEFAULT_QUEUE_RETRY_SECS,
        ));
        let http_timeout = Duration::from_secs(read_u64(
            lookup("ROMM_HTTP_TIMEOUT_SECS"),
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));
        let sync_on_start = read_bool(lookup("ROMM_SYNC_ON_START"), false);
        let accept_invalid_certs = read_bool(lookup("ROMM_INSECURE_TLS"), false);

        Ok(Self {
            server_url,
            username,
            password,
            state_file,
            saves_root,
            database_path,
            emulator,
            queue_retry_base,
            http_timeout,
            sync_on_start,
            accept_invalid_certs,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_backoff: Backoff::new(
                self.queue_retry_base,
                Duration::from_secs(MAX_QUEUE_RETRY_SECS).max(self.queue_retry_base),
                false,
            ),
            ..EngineConfig::default()
        }
    }

    /// How often the background task looks for due queue items.
    pub fn drain_interval(&self) -> Duration {
        self.queue_retry_base
            .max(Duration::from_secs(MIN_DRAIN_INTERVAL_SECS))
    }

    /// Random extra wait added to each drain tick, up to a quarter of the
    /// interval, so devices sharing a server do not retry in lockstep.
    pub fn drain_jitter(&self) -> Backoff {
        let spread = self.drain_interval() / 4;
        Backoff::new(spread, spread, true)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SaveSyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = RommClient::with_options(
            &config.server_url,
            config.username.clone(),
            config.password.clone(),
            ClientOptions {
                timeout: config.http_timeout,
                accept_invalid_certs: config.accept_invalid_certs,
            },
        )
        .context("failed to build RomM client")?;
        let store = match &config.database_path {
            Some(path) => SyncStore::open(path).await,
            None => SyncStore::new_default().await,
        }
        .context("failed to open save sync database")?;
        let locator = SaveLocator::new(
            RomRegistry::new(config.state_file.clone()),
            config.saves_root.clone(),
        );
        let engine = Arc::new(SaveSyncEngine::new(
            client,
            &config.emulator,
            store,
            locator,
            config.engine_config(),
        ));

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> Arc<SaveSyncEngine> {
        Arc::clone(&self.engine)
    }

    /// One full pass without the D-Bus service.
    pub async fn run_once(&self) -> anyhow::Result<SyncReport> {
        self.engine
            .sync_all()
            .await
            .context("save sync pass failed")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            server = %self.config.server_url,
            state_file = %self.config.state_file.display(),
            emulator = %self.config.emulator,
            sync_on_start = self.config.sync_on_start,
            "romm-saved started"
        );

        let dbus_connection = ConnectionBuilder::session()?
            .name(DBUS_NAME_SAVE_SYNC)?
            .serve_at(
                DBUS_OBJECT_PATH_SAVE_SYNC,
                SaveSyncDbusService::new(Arc::clone(&self.engine)),
            )?
            .build()
            .await
            .context("failed to start D-Bus object server")?;

        let signal_emitter = SignalEmitter::new(&dbus_connection, DBUS_OBJECT_PATH_SAVE_SYNC)
            .context("failed to create D-Bus signal emitter")?
            .into_owned();
        let shutdown = CancellationToken::new();

        let signal_handle = tokio::spawn(forward_progress_signals(
            self.engine.progress_hub(),
            signal_emitter,
            shutdown.clone(),
        ));

        let engine_for_queue = Arc::clone(&self.engine);
        let drain_interval = self.config.drain_interval();
        let drain_jitter = self.config.drain_jitter();
        let queue_shutdown = shutdown.clone();
        let queue_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = queue_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(drain_interval + drain_jitter.delay(0)) => {}
                }
                if let Err(err) = engine_for_queue.drain_offline_queue().await {
                    tracing::warn!(error = %err, "offline queue drain failed");
                }
            }
        });

        let startup_handle = self.config.sync_on_start.then(|| {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                match engine.sync_all().await {
                    Ok(report) => tracing::info!(message = %report.message, "startup sync finished"),
                    Err(err) => tracing::warn!(error = %err, "startup sync failed"),
                }
            })
        });

        let shutdown_result = tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal");
        tracing::info!("shutting down");
        shutdown.cancel();

        if let Some(handle) = startup_handle {
            handle.abort();
        }
        let _ = queue_handle.await;
        let _ = signal_handle.await;
        shutdown_result
    }
}

/// Re-emits hub events as D-Bus signals until `shutdown` fires or the hub
/// goes away.
async fn forward_progress_signals(
    hub: Arc<ProgressHub>,
    emitter: SignalEmitter<'static>,
    shutdown: CancellationToken,
) {
    let mut subscription = hub.subscribe();
    drop(hub);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => event,
        };
        let Some(event) = event else { break };
        let result = match event {
            SyncEvent::Progress(progress) => {
                SaveSyncDbusService::sync_progress_changed(
                    &emitter,
                    progress.running,
                    progress.phase.as_str(),
                    progress.current,
                    progress.total,
                    &progress.message,
                )
                .await
            }
            SyncEvent::LibrarySyncComplete(counts) => {
                SaveSyncDbusService::sync_complete(&emitter, counts).await
            }
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "failed to emit D-Bus signal");
        }
    }
    subscription.unsubscribe();
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
