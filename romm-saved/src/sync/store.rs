use std::path::{Path, PathBuf};

use romm_integrations::ids::{DATA_DIR_NAME, DATABASE_FILE_NAME};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::conflict::SyncCheckpoint;
use super::playtime::PlaytimeEntry;
use super::queue::{OfflineQueueItem, PendingConflict, QueueError, TransferDirection};
use super::settings::{ConflictMode, SaveSyncSettings, SettingsError, SettingsUpdate};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
}

#[derive(Clone)]
pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn settings(&self) -> Result<SaveSyncSettings, StoreError> {
        let row = sqlx::query(
            "SELECT sync_before_launch, sync_after_exit, conflict_mode FROM settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => settings_from_row(&row),
            None => Ok(SaveSyncSettings::default()),
        }
    }

    /// Validates and writes a partial change in one transaction. A rejected
    /// update leaves the stored row untouched.
    pub async fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<SaveSyncSettings, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT sync_before_launch, sync_after_exit, conflict_mode FROM settings WHERE id = 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let current = match row {
            Some(row) => settings_from_row(&row)?,
            None => SaveSyncSettings::default(),
        };
        let merged = update.apply_to(&current)?;

        sqlx::query(
            "INSERT INTO settings (id, sync_before_launch, sync_after_exit, conflict_mode)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                sync_before_launch = excluded.sync_before_launch,
                sync_after_exit = excluded.sync_after_exit,
                conflict_mode = excluded.conflict_mode",
        )
        .bind(merged.sync_before_launch)
        .bind(merged.sync_after_exit)
        .bind(merged.conflict_mode.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(merged)
    }

    pub async fn device(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let row = sqlx::query("SELECT device_id, device_name FROM device WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DeviceIdentity {
            device_id: row.try_get("device_id")?,
            device_name: row.try_get("device_name")?,
        }))
    }

    pub async fn save_device(
        &self,
        device: &DeviceIdentity,
        registered_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device (id, device_id, device_name, registered_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                device_name = excluded.device_name,
                registered_at = excluded.registered_at",
        )
        .bind(&device.device_id)
        .bind(&device.device_name)
        .bind(registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checkpoint(
        &self,
        rom_id: i64,
        filename: &str,
    ) -> Result<Option<SyncCheckpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT rom_id, filename, hash, local_mtime, remote_mtime, remote_save_id, synced_at
             FROM checkpoints WHERE rom_id = ?1 AND filename = ?2",
        )
        .bind(rom_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    pub async fn upsert_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checkpoints (rom_id, filename, hash, local_mtime, remote_mtime, remote_save_id, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(rom_id, filename) DO UPDATE SET
                hash = excluded.hash,
                local_mtime = excluded.local_mtime,
                remote_mtime = excluded.remote_mtime,
                remote_save_id = excluded.remote_save_id,
                synced_at = excluded.synced_at",
        )
        .bind(checkpoint.rom_id)
        .bind(&checkpoint.filename)
        .bind(&checkpoint.hash)
        .bind(checkpoint.local_mtime)
        .bind(checkpoint.remote_mtime)
        .bind(checkpoint.remote_save_id)
        .bind(checkpoint.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or replaces the conflict for `(rom_id, filename)`.
    pub async fn upsert_conflict(&self, conflict: &PendingConflict) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_conflicts
                (rom_id, filename, local_hash, remote_hash, local_mtime, remote_mtime, remote_save_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(rom_id, filename) DO UPDATE SET
                local_hash = excluded.local_hash,
                remote_hash = excluded.remote_hash,
                local_mtime = excluded.local_mtime,
                remote_mtime = excluded.remote_mtime,
                remote_save_id = excluded.remote_save_id,
                created_at = excluded.created_at",
        )
        .bind(conflict.rom_id)
        .bind(&conflict.filename)
        .bind(&conflict.local_hash)
        .bind(&conflict.remote_hash)
        .bind(conflict.local_mtime)
        .bind(conflict.remote_mtime)
        .bind(conflict.remote_save_id)
        .bind(conflict.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conflict(
        &self,
        rom_id: i64,
        filename: &str,
    ) -> Result<Option<PendingConflict>, StoreError> {
        let row = sqlx::query(
            "SELECT rom_id, filename, local_hash, remote_hash, local_mtime, remote_mtime, remote_save_id, created_at
             FROM pending_conflicts WHERE rom_id = ?1 AND filename = ?2",
        )
        .bind(rom_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    pub async fn list_conflicts(&self) -> Result<Vec<PendingConflict>, StoreError> {
        let rows = sqlx::query(
            "SELECT rom_id, filename, local_hash, remote_hash, local_mtime, remote_mtime, remote_save_id, created_at
             FROM pending_conflicts ORDER BY created_at ASC, rom_id ASC, filename ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    pub async fn remove_conflict(&self, rom_id: i64, filename: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM pending_conflicts WHERE rom_id = ?1 AND filename = ?2")
                .bind(rom_id)
                .bind(filename)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn conflict_count(&self) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM pending_conflicts")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    /// Records a failed transfer. A repeated failure for the same key keeps a
    /// single row, replaces the error and bumps `attempt_count`.
    pub async fn record_failure(
        &self,
        rom_id: i64,
        filename: &str,
        operation: TransferDirection,
        error: &str,
        failed_at: i64,
    ) -> Result<OfflineQueueItem, StoreError> {
        sqlx::query(
            "INSERT INTO offline_queue (rom_id, filename, operation, error, failed_at, attempt_count, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM offline_queue))
             ON CONFLICT(rom_id, filename) DO UPDATE SET
                operation = excluded.operation,
                error = excluded.error,
                failed_at = excluded.failed_at,
                attempt_count = offline_queue.attempt_count + 1,
                seq = excluded.seq",
        )
        .bind(rom_id)
        .bind(filename)
        .bind(operation.as_str())
        .bind(error)
        .bind(failed_at)
        .execute(&self.pool)
        .await?;

        self.queue_item(rom_id, filename)
            .await?
            .ok_or(StoreError::Sqlx(sqlx::Error::RowNotFound))
    }

    pub async fn queue_item(
        &self,
        rom_id: i64,
        filename: &str,
    ) -> Result<Option<OfflineQueueItem>, StoreError> {
        let row = sqlx::query(
            "SELECT rom_id, filename, operation, error, failed_at, attempt_count
             FROM offline_queue WHERE rom_id = ?1 AND filename = ?2",
        )
        .bind(rom_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    /// Oldest failure first.
    pub async fn list_queue(&self) -> Result<Vec<OfflineQueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT rom_id, filename, operation, error, failed_at, attempt_count
             FROM offline_queue ORDER BY failed_at ASC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_item_from_row).collect()
    }

    pub async fn remove_queue_item(&self, rom_id: i64, filename: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE rom_id = ?1 AND filename = ?2")
            .bind(rom_id)
            .bind(filename)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn playtime(&self, rom_id: i64) -> Result<Option<PlaytimeEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT rom_id, total_seconds, session_count, last_session_start, last_session_duration
             FROM playtime WHERE rom_id = ?1",
        )
        .bind(rom_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(playtime_from_row).transpose()
    }

    pub async fn save_playtime(&self, entry: &PlaytimeEntry, now: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO playtime
                (rom_id, total_seconds, session_count, last_session_start, last_session_duration, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(rom_id) DO UPDATE SET
                total_seconds = excluded.total_seconds,
                session_count = excluded.session_count,
                last_session_start = excluded.last_session_start,
                last_session_duration = excluded.last_session_duration,
                updated_at = excluded.updated_at",
        )
        .bind(entry.rom_id)
        .bind(entry.total_seconds)
        .bind(i64::from(entry.session_count))
        .bind(entry.last_session_start)
        .bind(entry.last_session_duration)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM offline_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn settings_from_row(row: &SqliteRow) -> Result<SaveSyncSettings, StoreError> {
    let conflict_mode: String = row.try_get("conflict_mode")?;
    Ok(SaveSyncSettings {
        sync_before_launch: row.try_get("sync_before_launch")?,
        sync_after_exit: row.try_get("sync_after_exit")?,
        conflict_mode: conflict_mode.parse::<ConflictMode>()?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<SyncCheckpoint, StoreError> {
    Ok(SyncCheckpoint {
        rom_id: row.try_get("rom_id")?,
        filename: row.try_get("filename")?,
        hash: row.try_get("hash")?,
        local_mtime: row.try_get("local_mtime")?,
        remote_mtime: row.try_get("remote_mtime")?,
        remote_save_id: row.try_get("remote_save_id")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<PendingConflict, StoreError> {
    Ok(PendingConflict {
        rom_id: row.try_get("rom_id")?,
        filename: row.try_get("filename")?,
        local_hash: row.try_get("local_hash")?,
        remote_hash: row.try_get("remote_hash")?,
        local_mtime: row.try_get("local_mtime")?,
        remote_mtime: row.try_get("remote_mtime")?,
        remote_save_id: row.try_get("remote_save_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn queue_item_from_row(row: &SqliteRow) -> Result<OfflineQueueItem, StoreError> {
    let operation: String = row.try_get("operation")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    Ok(OfflineQueueItem {
        rom_id: row.try_get("rom_id")?,
        filename: row.try_get("filename")?,
        operation: operation.parse()?,
        error: row.try_get("error")?,
        failed_at: row.try_get("failed_at")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
    })
}

fn playtime_from_row(row: &SqliteRow) -> Result<PlaytimeEntry, StoreError> {
    let session_count: i64 = row.try_get("session_count")?;
    Ok(PlaytimeEntry {
        rom_id: row.try_get("rom_id")?,
        total_seconds: row.try_get("total_seconds")?,
        session_count: u32::try_from(session_count).unwrap_or(u32::MAX),
        last_session_start: row.try_get("last_session_start")?,
        last_session_duration: row.try_get("last_session_duration")?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(data_dir.join(DATA_DIR_NAME).join(DATABASE_FILE_NAME))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
