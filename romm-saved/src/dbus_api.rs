use std::collections::HashMap;
use std::sync::Arc;

use romm_integrations::ids::{
    DBUS_ERROR_BUSY, DBUS_ERROR_FAILED, DBUS_ERROR_INVALID_ARGUMENT, DBUS_ERROR_NOT_FOUND,
    DBUS_ERROR_TRANSFER_FAILED,
};
use thiserror::Error;
use zbus::{interface, object_server::SignalEmitter};

use crate::sync::engine::{EngineError, SaveSyncEngine, SyncReport};
use crate::sync::progress::SyncProgress;
use crate::sync::settings::SaveSyncSettings;

type SettingsTuple = (bool, bool, String);
type ProgressTuple = (bool, String, u32, u32, String);

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("a sync is already running")]
    Busy,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    TransferFailed(String),
    #[error("{0}")]
    Failed(String),
}

pub fn dbus_error_name(err: &DbusServiceError) -> &'static str {
    match err {
        DbusServiceError::NotFound(_) => DBUS_ERROR_NOT_FOUND,
        DbusServiceError::Busy => DBUS_ERROR_BUSY,
        DbusServiceError::InvalidArgument(_) => DBUS_ERROR_INVALID_ARGUMENT,
        DbusServiceError::TransferFailed(_) => DBUS_ERROR_TRANSFER_FAILED,
        DbusServiceError::Failed(_) => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: DbusServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

impl From<EngineError> for DbusServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Busy => DbusServiceError::Busy,
            EngineError::Validation(message) => DbusServiceError::InvalidArgument(message),
            EngineError::NotFound(message) => DbusServiceError::NotFound(message),
            err @ (EngineError::Transfer(_) | EngineError::Enumeration(_)) => {
                DbusServiceError::TransferFailed(err.to_string())
            }
            err => DbusServiceError::Failed(err.to_string()),
        }
    }
}

fn map_engine_error(err: EngineError) -> zbus::fdo::Error {
    map_to_fdo(err.into())
}

fn settings_tuple(settings: SaveSyncSettings) -> SettingsTuple {
    (
        settings.sync_before_launch,
        settings.sync_after_exit,
        settings.conflict_mode.as_str().to_string(),
    )
}

pub fn progress_tuple(progress: &SyncProgress) -> ProgressTuple {
    (
        progress.running,
        progress.phase.as_str().to_string(),
        progress.current,
        progress.total,
        progress.message.clone(),
    )
}

pub struct SaveSyncDbusService {
    engine: Arc<SaveSyncEngine>,
}

impl SaveSyncDbusService {
    pub fn new(engine: Arc<SaveSyncEngine>) -> Self {
        Self { engine }
    }

    fn checked_filename(filename: &str) -> Result<(), zbus::fdo::Error> {
        if filename.trim().is_empty() {
            return Err(map_to_fdo(DbusServiceError::InvalidArgument(
                "filename must not be empty".to_string(),
            )));
        }
        Ok(())
    }

    fn log_report(method: &str, report: &SyncReport) {
        tracing::debug!(method, total = report.total, synced = report.synced, "dbus sync call finished");
    }
}

#[interface(name = "dev.rommdeck.SaveSync1")]
impl SaveSyncDbusService {
    async fn get_save_sync_settings(&self) -> zbus::fdo::Result<SettingsTuple> {
        let settings = self.engine.settings().await.map_err(map_engine_error)?;
        Ok(settings_tuple(settings))
    }

    async fn update_save_sync_settings(&self, changes_json: &str) -> zbus::fdo::Result<SettingsTuple> {
        let settings = self
            .engine
            .update_settings_json(changes_json)
            .await
            .map_err(map_engine_error)?;
        Ok(settings_tuple(settings))
    }

    async fn sync_all_saves(&self) -> zbus::fdo::Result<(String, u32)> {
        tracing::info!("dbus SyncAllSaves");
        let report = self.engine.sync_all().await.map_err(map_engine_error)?;
        Self::log_report("SyncAllSaves", &report);
        Ok((report.message, report.conflicts_outstanding))
    }

    async fn pre_launch_sync(&self, rom_id: i64) -> zbus::fdo::Result<(String, u32)> {
        tracing::info!(rom_id, "dbus PreLaunchSync");
        let report = self
            .engine
            .pre_launch_sync(rom_id)
            .await
            .map_err(map_engine_error)?;
        Self::log_report("PreLaunchSync", &report);
        Ok((report.message, report.synced))
    }

    async fn post_exit_sync(&self, rom_id: i64) -> zbus::fdo::Result<(String, u32)> {
        tracing::info!(rom_id, "dbus PostExitSync");
        let report = self
            .engine
            .post_exit_sync(rom_id)
            .await
            .map_err(map_engine_error)?;
        Self::log_report("PostExitSync", &report);
        Ok((report.message, report.synced))
    }

    async fn get_pending_conflicts(&self) -> zbus::fdo::Result<Vec<(i64, String, i64)>> {
        let conflicts = self
            .engine
            .pending_conflicts()
            .await
            .map_err(map_engine_error)?;
        Ok(conflicts
            .into_iter()
            .map(|conflict| (conflict.rom_id, conflict.filename, conflict.created_at))
            .collect())
    }

    async fn resolve_conflict(
        &self,
        rom_id: i64,
        filename: &str,
        resolution: &str,
    ) -> zbus::fdo::Result<()> {
        Self::checked_filename(filename)?;
        tracing::info!(rom_id, filename, resolution, "dbus ResolveConflict");
        self.engine
            .resolve_conflict(rom_id, filename, resolution)
            .await
            .map_err(map_engine_error)
    }

    async fn get_offline_queue(
        &self,
    ) -> zbus::fdo::Result<Vec<(i64, String, String, String, i64, u32)>> {
        let queue = self.engine.offline_queue().await.map_err(map_engine_error)?;
        Ok(queue
            .into_iter()
            .map(|item| {
                (
                    item.rom_id,
                    item.filename,
                    item.operation.as_str().to_string(),
                    item.error,
                    item.failed_at,
                    item.attempt_count,
                )
            })
            .collect())
    }

    async fn retry_failed_sync(&self, rom_id: i64, filename: &str) -> zbus::fdo::Result<bool> {
        Self::checked_filename(filename)?;
        tracing::info!(rom_id, filename, "dbus RetryFailedSync");
        self.engine
            .retry_failed_sync(rom_id, filename)
            .await
            .map_err(map_engine_error)
    }

    async fn clear_offline_queue(&self) -> zbus::fdo::Result<()> {
        self.engine
            .clear_offline_queue()
            .await
            .map(|_| ())
            .map_err(map_engine_error)
    }

    async fn get_sync_progress(&self) -> zbus::fdo::Result<ProgressTuple> {
        Ok(progress_tuple(&self.engine.progress()))
    }

    async fn get_save_status(
        &self,
        rom_id: i64,
    ) -> zbus::fdo::Result<Vec<(String, String, String, i64)>> {
        let entries = self
            .engine
            .save_status(rom_id)
            .await
            .map_err(map_engine_error)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                (
                    entry.filename,
                    entry.status.as_str().to_string(),
                    entry.local_hash.unwrap_or_default(),
                    entry.remote_save_id.unwrap_or(-1),
                )
            })
            .collect())
    }

    async fn report_library_sync_complete(
        &self,
        counts: HashMap<String, u32>,
    ) -> zbus::fdo::Result<()> {
        self.engine.report_library_sync(counts);
        Ok(())
    }

    async fn record_session_start(&self, rom_id: i64) -> zbus::fdo::Result<()> {
        tracing::info!(rom_id, "dbus RecordSessionStart");
        self.engine
            .record_session_start(rom_id)
            .await
            .map_err(map_engine_error)
    }

    /// Returns `(duration_secs, total_seconds, session_count)`.
    async fn record_session_end(&self, rom_id: i64) -> zbus::fdo::Result<(i64, i64, u32)> {
        tracing::info!(rom_id, "dbus RecordSessionEnd");
        let session = self
            .engine
            .record_session_end(rom_id)
            .await
            .map_err(map_engine_error)?;
        Ok((
            session.duration_secs,
            session.total_seconds,
            session.session_count,
        ))
    }

    /// Returns `(local_seconds, server_seconds, total_seconds, session_count)`.
    async fn get_playtime(&self, rom_id: i64) -> zbus::fdo::Result<(i64, i64, i64, u32)> {
        let playtime = self.engine.playtime(rom_id).await.map_err(map_engine_error)?;
        Ok((
            playtime.local_seconds,
            playtime.server_seconds,
            playtime.total_seconds,
            playtime.session_count,
        ))
    }

    #[zbus(signal)]
    pub async fn sync_progress_changed(
        ctxt: &SignalEmitter<'_>,
        running: bool,
        phase: &str,
        current: u32,
        total: u32,
        message: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn sync_complete(
        ctxt: &SignalEmitter<'_>,
        platform_counts: HashMap<String, u32>,
    ) -> zbus::Result<()>;
}
