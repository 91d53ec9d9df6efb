use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use romm_core::{RommClient, RommError, SaveInfo};
use romm_integrations::SaveFileStatus;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backoff::{Backoff, RetryPolicy};
use super::conflict::{FileMetadata, SaveState, SyncAction, SyncCheckpoint, classify, decide};
use super::local_saves::{LocalSave, LocalSaveError, SaveLocator, read_local_save};
use super::paths::save_path_for;
use super::playtime::{PlaytimeSummary, PlaytimeTracker, SessionSummary};
use super::progress::{ProgressHub, SyncPhase, SyncProgress};
use super::queue::{OfflineQueueItem, PendingConflict, QueueError, TransferDirection};
use super::settings::{ConflictMode, SaveSyncSettings, SettingsError, SettingsUpdate};
use super::store::{DeviceIdentity, StoreError, SyncStore};
use super::transfer::{SaveTransfer, TransferError};

const DEFAULT_QUEUE_RETRY_BASE_SECS: u64 = 300;
const MAX_QUEUE_RETRY_SECS: u64 = 6 * 60 * 60;
const FALLBACK_DEVICE_NAME: &str = "steamdeck";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a sync is already running")]
    Busy,
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed to list remote saves: {0}")]
    Enumeration(#[source] RommError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("local save error: {0}")]
    Local(#[from] LocalSaveError),
}

impl From<SettingsError> for EngineError {
    fn from(err: SettingsError) -> Self {
        EngineError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub list_retry: RetryPolicy,
    pub queue_backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            list_retry: RetryPolicy::default(),
            queue_backoff: Backoff::new(
                Duration::from_secs(DEFAULT_QUEUE_RETRY_BASE_SECS),
                Duration::from_secs(MAX_QUEUE_RETRY_SECS),
                false,
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total: u32,
    pub skipped: u32,
    pub synced: u32,
    pub conflicts_opened: u32,
    pub queued: u32,
    pub conflicts_outstanding: u32,
    pub message: String,
}

impl SyncReport {
    fn skipped_with(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    fn summarize(&mut self) {
        self.message = if self.total == 0 {
            "No saves to sync".to_string()
        } else {
            format!(
                "Synced {} of {} saves ({} conflicts, {} queued, {} unchanged)",
                self.synced, self.total, self.conflicts_opened, self.queued, self.skipped
            )
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: u32,
    pub succeeded: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveStatusEntry {
    pub filename: String,
    pub status: SaveFileStatus,
    pub local_hash: Option<String>,
    pub remote_save_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSave {
    pub id: i64,
    pub hash: Option<String>,
    pub modified: i64,
}

impl RemoteSave {
    fn from_info(info: &SaveInfo) -> Self {
        Self {
            id: info.id,
            hash: info.hash().map(str::to_string),
            // Saves without a parseable timestamp sort as the oldest.
            modified: info.modified_at().and_then(parse_server_time).unwrap_or(0),
        }
    }
}

/// One save artifact as seen during a pass. Built fresh every time.
#[derive(Debug, Clone)]
pub struct SaveFileRecord {
    pub rom_id: i64,
    pub filename: String,
    pub saves_dir: PathBuf,
    pub local: Option<LocalSave>,
    pub remote: Option<RemoteSave>,
}

impl SaveFileRecord {
    fn local_meta(&self) -> Option<FileMetadata> {
        self.local
            .as_ref()
            .map(|save| FileMetadata::new(save.modified, Some(save.hash.clone())))
    }

    fn remote_meta(&self) -> Option<FileMetadata> {
        self.remote
            .as_ref()
            .map(|save| FileMetadata::new(save.modified, save.hash.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassScope {
    Full,
    PreLaunch(i64),
    PostExit(i64),
}

impl PassScope {
    fn rom_id(self) -> Option<i64> {
        match self {
            PassScope::Full => None,
            PassScope::PreLaunch(rom_id) | PassScope::PostExit(rom_id) => Some(rom_id),
        }
    }

    fn allows(self, action: SyncAction) -> bool {
        match (self, action) {
            (PassScope::PreLaunch(_), SyncAction::Upload) => false,
            (PassScope::PostExit(_), SyncAction::Download) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Synced,
    Skipped,
    ConflictOpened,
    Queued,
}

pub struct SaveSyncEngine {
    client: RommClient,
    transfer: SaveTransfer,
    store: SyncStore,
    locator: SaveLocator,
    playtime: PlaytimeTracker,
    progress: Arc<ProgressHub>,
    config: EngineConfig,
    pass_lock: Mutex<()>,
}

impl SaveSyncEngine {
    pub fn new(
        client: RommClient,
        emulator: &str,
        store: SyncStore,
        locator: SaveLocator,
        config: EngineConfig,
    ) -> Self {
        Self {
            transfer: SaveTransfer::new(client.clone(), emulator),
            playtime: PlaytimeTracker::new(client.clone(), store.clone()),
            client,
            store,
            locator,
            progress: Arc::new(ProgressHub::new()),
            config,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn progress_hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.progress)
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.snapshot()
    }

    pub async fn settings(&self) -> Result<SaveSyncSettings, EngineError> {
        Ok(self.store.settings().await?)
    }

    pub async fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<SaveSyncSettings, EngineError> {
        match self.store.update_settings(update).await {
            Ok(settings) => {
                tracing::info!(
                    sync_before_launch = settings.sync_before_launch,
                    sync_after_exit = settings.sync_after_exit,
                    conflict_mode = %settings.conflict_mode,
                    "save sync settings updated"
                );
                Ok(settings)
            }
            Err(StoreError::Settings(err)) => Err(err.into()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_settings_json(&self, raw: &str) -> Result<SaveSyncSettings, EngineError> {
        let update = SettingsUpdate::from_json(raw)?;
        self.update_settings(&update).await
    }

    /// Full pass over every installed ROM.
    pub async fn sync_all(&self) -> Result<SyncReport, EngineError> {
        self.run_pass(PassScope::Full).await
    }

    /// Pulls newer server saves for one ROM before the game starts.
    pub async fn pre_launch_sync(&self, rom_id: i64) -> Result<SyncReport, EngineError> {
        if !self.store.settings().await?.sync_before_launch {
            return Ok(SyncReport::skipped_with("Pre-launch sync is disabled"));
        }
        self.run_pass(PassScope::PreLaunch(rom_id)).await
    }

    /// Pushes changed local saves for one ROM after the game exits.
    pub async fn post_exit_sync(&self, rom_id: i64) -> Result<SyncReport, EngineError> {
        if !self.store.settings().await?.sync_after_exit {
            return Ok(SyncReport::skipped_with("Post-exit sync is disabled"));
        }
        self.run_pass(PassScope::PostExit(rom_id)).await
    }

    pub async fn pending_conflicts(&self) -> Result<Vec<PendingConflict>, EngineError> {
        Ok(self.store.list_conflicts().await?)
    }

    pub async fn offline_queue(&self) -> Result<Vec<OfflineQueueItem>, EngineError> {
        Ok(self.store.list_queue().await?)
    }

    pub async fn clear_offline_queue(&self) -> Result<u64, EngineError> {
        let removed = self.store.clear_queue().await?;
        tracing::info!(removed, "offline queue cleared");
        Ok(removed)
    }

    pub fn report_library_sync(&self, counts: HashMap<String, u32>) {
        tracing::info!(platforms = counts.len(), "library sync reported complete");
        self.progress.report_library_sync(counts);
    }

    /// Applies the user's choice for an open conflict. The conflict entry is
    /// only removed once the transfer went through.
    pub async fn resolve_conflict(
        &self,
        rom_id: i64,
        filename: &str,
        resolution: &str,
    ) -> Result<(), EngineError> {
        let direction: TransferDirection = resolution
            .parse()
            .map_err(|err: QueueError| EngineError::Validation(err.to_string()))?;
        let _guard = self.pass_lock.try_lock().map_err(|_| EngineError::Busy)?;
        if self.store.conflict(rom_id, filename).await?.is_none() {
            return Err(EngineError::NotFound(format!(
                "no pending conflict for rom {rom_id} file {filename}"
            )));
        }

        let device = self.ensure_device().await?;
        let record = self.record_for_key(rom_id, filename, &device).await?;
        let checkpoint = match self.transfer_record(&record, direction, &device).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                tracing::warn!(rom_id, filename, %direction, error = %err, "conflict resolution failed");
                return Err(err.into());
            }
        };
        self.store.upsert_checkpoint(&checkpoint).await?;
        self.store.remove_conflict(rom_id, filename).await?;
        self.store.remove_queue_item(rom_id, filename).await?;
        tracing::info!(rom_id, filename, %direction, "conflict resolved");
        Ok(())
    }

    /// Re-attempts one queued operation. `Ok(false)` means it failed again
    /// and the queue entry was updated, or the server rejected the write and
    /// the item became a pending conflict.
    pub async fn retry_failed_sync(&self, rom_id: i64, filename: &str) -> Result<bool, EngineError> {
        let _guard = self.pass_lock.try_lock().map_err(|_| EngineError::Busy)?;
        let item = self
            .store
            .queue_item(rom_id, filename)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("no queued sync for rom {rom_id} file {filename}"))
            })?;
        let device = self.ensure_device().await?;
        self.retry_item(&item, &device).await
    }

    /// Retries queued operations whose backoff has elapsed, provided the
    /// server answers its heartbeat. Does nothing while a pass runs.
    pub async fn drain_offline_queue(&self) -> Result<DrainReport, EngineError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            return Ok(DrainReport::default());
        };
        let now = now_unix();
        let due: Vec<OfflineQueueItem> = self
            .store
            .list_queue()
            .await?
            .into_iter()
            .filter(|item| item.is_due(now, &self.config.queue_backoff))
            .collect();
        if due.is_empty() {
            return Ok(DrainReport::default());
        }
        if let Err(err) = self.client.heartbeat().await {
            tracing::debug!(error = %err, pending = due.len(), "server unreachable, keeping offline queue");
            return Ok(DrainReport::default());
        }

        let device = self.ensure_device().await?;
        let mut report = DrainReport::default();
        for item in &due {
            report.attempted += 1;
            if self.retry_item(item, &device).await? {
                report.succeeded += 1;
            }
        }
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            "offline queue drained"
        );
        Ok(report)
    }

    /// Per-file view of one ROM without transferring anything. When the
    /// server cannot be reached the local side is still reported.
    pub async fn save_status(&self, rom_id: i64) -> Result<Vec<SaveStatusEntry>, EngineError> {
        let Some(rom) = self.locator.registry().get(rom_id).await? else {
            return Ok(Vec::new());
        };
        let Some(saves_dir) = self.locator.saves_dir(&rom) else {
            return Ok(Vec::new());
        };
        let local = self.locator.discover(&rom).await?;
        let device = self.store.device().await?;
        let remote = match self
            .list_remote(rom_id, device.as_ref().map(|d| d.device_id.as_str()))
            .await
        {
            Ok(remote) => Some(remote),
            Err(err) => {
                tracing::warn!(rom_id, error = %err, "save status without server data");
                None
            }
        };
        let remote_known = remote.is_some();

        let mut entries = Vec::new();
        for record in merge_saves(rom_id, &saves_dir, local, remote.unwrap_or_default()) {
            let status = if self
                .store
                .conflict(rom_id, &record.filename)
                .await?
                .is_some()
            {
                SaveFileStatus::Conflict
            } else if !remote_known {
                SaveFileStatus::Unknown
            } else {
                let checkpoint = self.store.checkpoint(rom_id, &record.filename).await?;
                let state = classify(
                    record.local_meta().as_ref(),
                    record.remote_meta().as_ref(),
                    checkpoint.as_ref(),
                );
                match state.status() {
                    Some(status) => status,
                    None => continue,
                }
            };
            entries.push(SaveStatusEntry {
                local_hash: record.local.as_ref().map(|save| save.hash.clone()),
                remote_save_id: record.remote.as_ref().map(|save| save.id),
                filename: record.filename,
                status,
            });
        }
        Ok(entries)
    }

    pub async fn record_session_start(&self, rom_id: i64) -> Result<(), EngineError> {
        self.playtime.record_session_start(rom_id, now_unix()).await?;
        Ok(())
    }

    /// Ends the running play session and merges the new total into the
    /// server's playtime note.
    pub async fn record_session_end(&self, rom_id: i64) -> Result<SessionSummary, EngineError> {
        let device = self.ensure_device().await?;
        self.playtime
            .record_session_end(rom_id, now_unix(), &device.device_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no active play session for rom {rom_id}")))
    }

    pub async fn playtime(&self, rom_id: i64) -> Result<PlaytimeSummary, EngineError> {
        Ok(self.playtime.summary(rom_id).await?)
    }

    /// Local device identity, generated and persisted on first use.
    pub async fn ensure_device(&self) -> Result<DeviceIdentity, EngineError> {
        if let Some(device) = self.store.device().await? {
            return Ok(device);
        }
        let device = DeviceIdentity {
            device_id: Uuid::new_v4().to_string(),
            device_name: local_hostname(),
        };
        self.store.save_device(&device, now_unix()).await?;
        tracing::info!(
            device_id = %device.device_id,
            device_name = %device.device_name,
            "registered sync device"
        );
        Ok(device)
    }

    async fn run_pass(&self, scope: PassScope) -> Result<SyncReport, EngineError> {
        let _guard = self.pass_lock.try_lock().map_err(|_| EngineError::Busy)?;
        tracing::info!(?scope, "save sync pass started");
        self.progress.publish(SyncProgress::enumerating());

        match self.execute_pass(scope).await {
            Ok(report) => {
                tracing::info!(
                    total = report.total,
                    synced = report.synced,
                    conflicts = report.conflicts_opened,
                    queued = report.queued,
                    skipped = report.skipped,
                    "save sync pass finished"
                );
                self.progress.publish(SyncProgress::finished(
                    SyncPhase::Done,
                    report.total,
                    report.message.clone(),
                ));
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(?scope, error = %err, "save sync pass failed");
                self.progress
                    .publish(SyncProgress::finished(SyncPhase::Failed, 0, err.to_string()));
                Err(err)
            }
        }
    }

    async fn execute_pass(&self, scope: PassScope) -> Result<SyncReport, EngineError> {
        let mode = self.store.settings().await?.conflict_mode;
        let device = self.ensure_device().await?;
        let records = self.enumerate(scope, &device).await?;

        let total = u32::try_from(records.len()).unwrap_or(u32::MAX);
        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };
        for (index, record) in records.iter().enumerate() {
            let current = u32::try_from(index + 1).unwrap_or(u32::MAX);
            self.progress.publish(SyncProgress::syncing(
                current,
                total,
                record.filename.clone(),
            ));
            match self.process_record(record, scope, mode, &device).await? {
                ItemOutcome::Synced => report.synced += 1,
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::ConflictOpened => report.conflicts_opened += 1,
                ItemOutcome::Queued => report.queued += 1,
            }
        }
        report.conflicts_outstanding = self.store.conflict_count().await?;
        report.summarize();
        Ok(report)
    }

    async fn enumerate(
        &self,
        scope: PassScope,
        device: &DeviceIdentity,
    ) -> Result<Vec<SaveFileRecord>, EngineError> {
        let registry = self.locator.registry();
        let roms = match scope.rom_id() {
            None => registry.installed_roms().await?,
            Some(rom_id) => registry.get(rom_id).await?.into_iter().collect(),
        };

        let mut records = Vec::new();
        for rom in &roms {
            let Some(saves_dir) = self.locator.saves_dir(rom) else {
                tracing::debug!(rom_id = rom.rom_id, "rom has no system, skipping saves");
                continue;
            };
            let local = self.locator.discover(rom).await?;
            let remote = self
                .list_remote(rom.rom_id, Some(&device.device_id))
                .await
                .map_err(EngineError::Enumeration)?;
            records.extend(merge_saves(rom.rom_id, &saves_dir, local, remote));
        }
        Ok(records)
    }

    async fn process_record(
        &self,
        record: &SaveFileRecord,
        scope: PassScope,
        mode: ConflictMode,
        device: &DeviceIdentity,
    ) -> Result<ItemOutcome, EngineError> {
        let checkpoint = self
            .store
            .checkpoint(record.rom_id, &record.filename)
            .await?;
        let local = record.local_meta();
        let remote = record.remote_meta();
        let state = classify(local.as_ref(), remote.as_ref(), checkpoint.as_ref());
        let action = decide(local.as_ref(), remote.as_ref(), checkpoint.as_ref(), mode);
        tracing::debug!(
            rom_id = record.rom_id,
            filename = %record.filename,
            ?state,
            ?action,
            "save classified"
        );

        if !scope.allows(action) {
            return Ok(ItemOutcome::Skipped);
        }

        let direction = match action {
            SyncAction::Skip => {
                if state == SaveState::InSync {
                    self.refresh_checkpoint(record, checkpoint.as_ref()).await?;
                }
                return Ok(ItemOutcome::Skipped);
            }
            SyncAction::AskUser => {
                let already_open = self
                    .store
                    .conflict(record.rom_id, &record.filename)
                    .await?
                    .is_some();
                self.open_conflict(record).await?;
                return Ok(if already_open {
                    ItemOutcome::Skipped
                } else {
                    ItemOutcome::ConflictOpened
                });
            }
            SyncAction::Upload => TransferDirection::Upload,
            SyncAction::Download => TransferDirection::Download,
        };

        match self.transfer_record(record, direction, device).await {
            Ok(checkpoint) => {
                self.store.upsert_checkpoint(&checkpoint).await?;
                self.store
                    .remove_queue_item(record.rom_id, &record.filename)
                    .await?;
                tracing::info!(
                    rom_id = record.rom_id,
                    filename = %record.filename,
                    %direction,
                    "save synced"
                );
                Ok(ItemOutcome::Synced)
            }
            Err(err) if err.is_conflict() => {
                tracing::warn!(
                    rom_id = record.rom_id,
                    filename = %record.filename,
                    error = %err,
                    "server rejected write, recording conflict"
                );
                self.open_conflict(record).await?;
                Ok(ItemOutcome::ConflictOpened)
            }
            Err(err) => {
                tracing::warn!(
                    rom_id = record.rom_id,
                    filename = %record.filename,
                    %direction,
                    error = %err,
                    "save transfer failed, queued for retry"
                );
                self.store
                    .record_failure(
                        record.rom_id,
                        &record.filename,
                        direction,
                        &err.to_string(),
                        now_unix(),
                    )
                    .await?;
                Ok(ItemOutcome::Queued)
            }
        }
    }

    async fn transfer_record(
        &self,
        record: &SaveFileRecord,
        direction: TransferDirection,
        device: &DeviceIdentity,
    ) -> Result<SyncCheckpoint, TransferError> {
        let now = now_unix();
        match direction {
            TransferDirection::Upload => {
                let local = record.local.as_ref().ok_or_else(|| {
                    TransferError::MissingSource(format!("no local copy of {}", record.filename))
                })?;
                let uploaded = self
                    .transfer
                    .upload_from_path(
                        record.rom_id,
                        &local.path,
                        &record.filename,
                        record.remote.as_ref().map(|remote| remote.id),
                        Some(&device.device_id),
                    )
                    .await?;
                Ok(SyncCheckpoint {
                    rom_id: record.rom_id,
                    filename: record.filename.clone(),
                    hash: Some(uploaded.hash),
                    local_mtime: Some(local.modified),
                    remote_mtime: Some(
                        uploaded
                            .info
                            .modified_at()
                            .and_then(parse_server_time)
                            .unwrap_or(now),
                    ),
                    remote_save_id: Some(uploaded.info.id),
                    synced_at: now,
                })
            }
            TransferDirection::Download => {
                let remote = record.remote.as_ref().ok_or_else(|| {
                    TransferError::MissingSource(format!("no server copy of {}", record.filename))
                })?;
                let target = save_path_for(&record.saves_dir, &record.filename)?;
                let downloaded = self
                    .transfer
                    .download_to_path(
                        remote.id,
                        &target,
                        remote.hash.as_deref(),
                        Some(&device.device_id),
                    )
                    .await?;
                if let Some(backup) = &downloaded.backup {
                    tracing::info!(backup = %backup.display(), "previous save backed up");
                }
                Ok(SyncCheckpoint {
                    rom_id: record.rom_id,
                    filename: record.filename.clone(),
                    hash: Some(downloaded.hash),
                    local_mtime: Some(downloaded.modified),
                    remote_mtime: Some(remote.modified),
                    remote_save_id: Some(remote.id),
                    synced_at: now,
                })
            }
        }
    }

    async fn retry_item(
        &self,
        item: &OfflineQueueItem,
        device: &DeviceIdentity,
    ) -> Result<bool, EngineError> {
        let attempt = match self
            .record_for_key(item.rom_id, &item.filename, device)
            .await
        {
            Ok(record) => self
                .transfer_record(&record, item.operation, device)
                .await
                .map_err(|err| (Some(record), EngineError::from(err))),
            Err(err) => Err((None, err)),
        };

        match attempt {
            Ok(checkpoint) => {
                self.store.upsert_checkpoint(&checkpoint).await?;
                self.store
                    .remove_queue_item(item.rom_id, &item.filename)
                    .await?;
                tracing::info!(
                    rom_id = item.rom_id,
                    filename = %item.filename,
                    operation = %item.operation,
                    "queued sync succeeded"
                );
                Ok(true)
            }
            Err((_, err @ EngineError::Store(_))) => Err(err),
            Err((Some(record), EngineError::Transfer(err))) if err.is_conflict() => {
                tracing::warn!(
                    rom_id = item.rom_id,
                    filename = %item.filename,
                    error = %err,
                    "server rejected queued write, recording conflict"
                );
                self.open_conflict(&record).await?;
                self.store
                    .remove_queue_item(item.rom_id, &item.filename)
                    .await?;
                Ok(false)
            }
            Err((_, err)) => {
                let updated = self
                    .store
                    .record_failure(
                        item.rom_id,
                        &item.filename,
                        item.operation,
                        &err.to_string(),
                        now_unix(),
                    )
                    .await?;
                tracing::warn!(
                    rom_id = item.rom_id,
                    filename = %item.filename,
                    attempts = updated.attempt_count,
                    error = %err,
                    "queued sync failed again"
                );
                Ok(false)
            }
        }
    }

    /// Fresh record for a single key, used outside of passes.
    async fn record_for_key(
        &self,
        rom_id: i64,
        filename: &str,
        device: &DeviceIdentity,
    ) -> Result<SaveFileRecord, EngineError> {
        let rom = self
            .locator
            .registry()
            .get(rom_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("rom {rom_id} is not installed")))?;
        let saves_dir = self.locator.saves_dir(&rom).ok_or_else(|| {
            EngineError::NotFound(format!("rom {rom_id} has no save directory"))
        })?;
        let path = save_path_for(&saves_dir, filename).map_err(TransferError::from)?;
        let local = read_local_save(&path, filename.to_string()).await?;
        let remote = self
            .list_remote(rom_id, Some(&device.device_id))
            .await
            .map_err(TransferError::from)?;
        let remote = newest_named(remote.iter(), filename);

        Ok(SaveFileRecord {
            rom_id,
            filename: filename.to_string(),
            saves_dir,
            local,
            remote,
        })
    }

    async fn open_conflict(&self, record: &SaveFileRecord) -> Result<(), EngineError> {
        let conflict = PendingConflict {
            rom_id: record.rom_id,
            filename: record.filename.clone(),
            local_hash: record.local.as_ref().map(|save| save.hash.clone()),
            remote_hash: record.remote.as_ref().and_then(|save| save.hash.clone()),
            local_mtime: record.local.as_ref().map(|save| save.modified),
            remote_mtime: record.remote.as_ref().map(|save| save.modified),
            remote_save_id: record.remote.as_ref().map(|save| save.id),
            created_at: now_unix(),
        };
        self.store.upsert_conflict(&conflict).await?;
        tracing::info!(
            rom_id = record.rom_id,
            filename = %record.filename,
            "save conflict waiting for user"
        );
        Ok(())
    }

    /// Both sides agree; remember it so later edits are attributed correctly.
    async fn refresh_checkpoint(
        &self,
        record: &SaveFileRecord,
        existing: Option<&SyncCheckpoint>,
    ) -> Result<(), EngineError> {
        let (Some(local), Some(remote)) = (&record.local, &record.remote) else {
            return Ok(());
        };
        let unchanged = existing.is_some_and(|checkpoint| {
            checkpoint.hash.as_deref() == Some(local.hash.as_str())
                && checkpoint.remote_save_id == Some(remote.id)
                && checkpoint.remote_mtime == Some(remote.modified)
        });
        if unchanged {
            return Ok(());
        }
        self.store
            .upsert_checkpoint(&SyncCheckpoint {
                rom_id: record.rom_id,
                filename: record.filename.clone(),
                hash: Some(local.hash.clone()),
                local_mtime: Some(local.modified),
                remote_mtime: Some(remote.modified),
                remote_save_id: Some(remote.id),
                synced_at: now_unix(),
            })
            .await?;
        Ok(())
    }

    async fn list_remote(
        &self,
        rom_id: i64,
        device_id: Option<&str>,
    ) -> Result<Vec<SaveInfo>, RommError> {
        let client = &self.client;
        self.config
            .list_retry
            .run(
                move || client.list_saves(rom_id, device_id),
                RommError::is_retryable,
            )
            .await
    }
}

fn merge_saves(
    rom_id: i64,
    saves_dir: &Path,
    local: Vec<LocalSave>,
    remote: Vec<SaveInfo>,
) -> Vec<SaveFileRecord> {
    let mut by_name: BTreeMap<String, (Option<LocalSave>, Option<RemoteSave>)> = BTreeMap::new();
    for save in local {
        let key = save.filename.clone();
        by_name.entry(key).or_default().0 = Some(save);
    }
    for info in remote.iter().filter(|info| !info.file_name.is_empty()) {
        let slot = &mut by_name.entry(info.file_name.clone()).or_default().1;
        *slot = newest_of(slot.take(), RemoteSave::from_info(info));
    }

    by_name
        .into_iter()
        .map(|(filename, (local, remote))| SaveFileRecord {
            rom_id,
            filename,
            saves_dir: saves_dir.to_path_buf(),
            local,
            remote,
        })
        .collect()
}

/// The server may hold several saves under one name; the newest one counts.
fn newest_of(current: Option<RemoteSave>, candidate: RemoteSave) -> Option<RemoteSave> {
    match current {
        Some(current) if current.modified >= candidate.modified => Some(current),
        _ => Some(candidate),
    }
}

fn newest_named<'a>(
    saves: impl Iterator<Item = &'a SaveInfo>,
    filename: &str,
) -> Option<RemoteSave> {
    saves
        .filter(|info| info.file_name == filename)
        .fold(None, |current, info| {
            newest_of(current, RemoteSave::from_info(info))
        })
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// RFC 3339 timestamps, or naive ones which RomM reports in UTC.
fn parse_server_time(raw: &str) -> Option<i64> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed.unix_timestamp());
    }
    let without_fraction = raw.split('.').next()?;
    PrimitiveDateTime::parse(
        without_fraction,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    )
    .ok()
    .map(|naive| naive.assume_utc().unix_timestamp())
}

fn local_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
