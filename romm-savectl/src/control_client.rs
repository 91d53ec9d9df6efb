use std::collections::HashMap;

use anyhow::{Context, Result};
use romm_integrations::ids::{
    DBUS_INTERFACE_SAVE_SYNC, DBUS_NAME_SAVE_SYNC, DBUS_OBJECT_PATH_SAVE_SYNC,
};
use serde::Serialize;
use zbus::blocking::{Connection, Proxy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsView {
    pub sync_before_launch: bool,
    pub sync_after_exit: bool,
    pub conflict_mode: String,
}

impl From<(bool, bool, String)> for SettingsView {
    fn from((sync_before_launch, sync_after_exit, conflict_mode): (bool, bool, String)) -> Self {
        Self {
            sync_before_launch,
            sync_after_exit,
            conflict_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub running: bool,
    pub phase: String,
    pub current: u32,
    pub total: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictView {
    pub rom_id: i64,
    pub filename: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItemView {
    pub rom_id: i64,
    pub filename: String,
    pub operation: String,
    pub error: String,
    pub failed_at: i64,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveStatusView {
    pub filename: String,
    pub status: String,
    pub local_hash: Option<String>,
    pub remote_save_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub message: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub duration_secs: i64,
    pub total_seconds: i64,
    pub session_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaytimeView {
    pub local_seconds: i64,
    pub server_seconds: i64,
    pub total_seconds: i64,
    pub session_count: u32,
}

pub struct SaveSyncClient {
    connection: Connection,
}

impl SaveSyncClient {
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::session().context("failed to connect to session D-Bus for SaveSync1")?;
        Ok(Self { connection })
    }

    pub fn settings(&self) -> Result<SettingsView> {
        let settings: (bool, bool, String) = self
            .proxy()?
            .call("GetSaveSyncSettings", &())
            .context("GetSaveSyncSettings failed")?;
        Ok(settings.into())
    }

    pub fn update_settings(&self, changes_json: &str) -> Result<SettingsView> {
        let settings: (bool, bool, String) = self
            .proxy()?
            .call("UpdateSaveSyncSettings", &(changes_json,))
            .context("UpdateSaveSyncSettings failed")?;
        Ok(settings.into())
    }

    pub fn sync_all(&self) -> Result<SyncOutcome> {
        let (message, count): (String, u32) = self
            .proxy()?
            .call("SyncAllSaves", &())
            .context("SyncAllSaves failed")?;
        Ok(SyncOutcome { message, count })
    }

    pub fn pre_launch_sync(&self, rom_id: i64) -> Result<SyncOutcome> {
        let (message, count): (String, u32) = self
            .proxy()?
            .call("PreLaunchSync", &(rom_id,))
            .context("PreLaunchSync failed")?;
        Ok(SyncOutcome { message, count })
    }

    pub fn post_exit_sync(&self, rom_id: i64) -> Result<SyncOutcome> {
        let (message, count): (String, u32) = self
            .proxy()?
            .call("PostExitSync", &(rom_id,))
            .context("PostExitSync failed")?;
        Ok(SyncOutcome { message, count })
    }

    pub fn progress(&self) -> Result<ProgressView> {
        let (running, phase, current, total, message): (bool, String, u32, u32, String) = self
            .proxy()?
            .call("GetSyncProgress", &())
            .context("GetSyncProgress failed")?;
        Ok(ProgressView {
            running,
            phase,
            current,
            total,
            message,
        })
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictView>> {
        let conflicts: Vec<(i64, String, i64)> = self
            .proxy()?
            .call("GetPendingConflicts", &())
            .context("GetPendingConflicts failed")?;
        Ok(conflicts
            .into_iter()
            .map(|(rom_id, filename, created_at)| ConflictView {
                rom_id,
                filename,
                created_at,
            })
            .collect())
    }

    pub fn resolve_conflict(&self, rom_id: i64, filename: &str, resolution: &str) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("ResolveConflict", &(rom_id, filename, resolution))
            .context("ResolveConflict failed")
    }

    pub fn offline_queue(&self) -> Result<Vec<QueueItemView>> {
        let items: Vec<(i64, String, String, String, i64, u32)> = self
            .proxy()?
            .call("GetOfflineQueue", &())
            .context("GetOfflineQueue failed")?;
        Ok(items
            .into_iter()
            .map(
                |(rom_id, filename, operation, error, failed_at, attempt_count)| QueueItemView {
                    rom_id,
                    filename,
                    operation,
                    error,
                    failed_at,
                    attempt_count,
                },
            )
            .collect())
    }

    pub fn retry_failed_sync(&self, rom_id: i64, filename: &str) -> Result<bool> {
        self.proxy()?
            .call("RetryFailedSync", &(rom_id, filename))
            .context("RetryFailedSync failed")
    }

    pub fn clear_offline_queue(&self) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("ClearOfflineQueue", &())
            .context("ClearOfflineQueue failed")
    }

    pub fn save_status(&self, rom_id: i64) -> Result<Vec<SaveStatusView>> {
        let entries: Vec<(String, String, String, i64)> = self
            .proxy()?
            .call("GetSaveStatus", &(rom_id,))
            .context("GetSaveStatus failed")?;
        Ok(entries
            .into_iter()
            .map(|(filename, status, local_hash, remote_save_id)| SaveStatusView {
                filename,
                status,
                local_hash: (!local_hash.is_empty()).then_some(local_hash),
                remote_save_id: (remote_save_id >= 0).then_some(remote_save_id),
            })
            .collect())
    }

    pub fn report_library_sync(&self, counts: &HashMap<String, u32>) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("ReportLibrarySyncComplete", &(counts,))
            .context("ReportLibrarySyncComplete failed")
    }

    pub fn record_session_start(&self, rom_id: i64) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("RecordSessionStart", &(rom_id,))
            .context("RecordSessionStart failed")
    }

    pub fn record_session_end(&self, rom_id: i64) -> Result<SessionView> {
        let (duration_secs, total_seconds, session_count): (i64, i64, u32) = self
            .proxy()?
            .call("RecordSessionEnd", &(rom_id,))
            .context("RecordSessionEnd failed")?;
        Ok(SessionView {
            duration_secs,
            total_seconds,
            session_count,
        })
    }

    pub fn playtime(&self, rom_id: i64) -> Result<PlaytimeView> {
        let (local_seconds, server_seconds, total_seconds, session_count): (i64, i64, i64, u32) =
            self.proxy()?
                .call("GetPlaytime", &(rom_id,))
                .context("GetPlaytime failed")?;
        Ok(PlaytimeView {
            local_seconds,
            server_seconds,
            total_seconds,
            session_count,
        })
    }

    fn proxy(&self) -> Result<Proxy<'_>> {
        Proxy::new(
            &self.connection,
            DBUS_NAME_SAVE_SYNC,
            DBUS_OBJECT_PATH_SAVE_SYNC,
            DBUS_INTERFACE_SAVE_SYNC,
        )
        .context("failed to create SaveSync1 proxy")
    }
}
