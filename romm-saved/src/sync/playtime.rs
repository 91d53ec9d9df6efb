use romm_core::{NewRomNote, RomNote, RommClient, RommError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::store::{StoreError, SyncStore};

pub const PLAYTIME_NOTE_TITLE: &str = "romm-sync:playtime";
pub const PLAYTIME_NOTE_TAG: &str = "romm-sync";
/// Longest session that is credited; a start without a matching end (the
/// deck slept, the daemon crashed) must not add days of playtime.
pub const MAX_SESSION_SECS: i64 = 24 * 60 * 60;

/// Local playtime bookkeeping for one ROM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaytimeEntry {
    pub rom_id: i64,
    pub total_seconds: i64,
    pub session_count: u32,
    pub last_session_start: Option<i64>,
    pub last_session_duration: Option<i64>,
}

impl PlaytimeEntry {
    pub fn new(rom_id: i64) -> Self {
        Self {
            rom_id,
            total_seconds: 0,
            session_count: 0,
            last_session_start: None,
            last_session_duration: None,
        }
    }

    /// Closes the running session. `None` when no session was started.
    pub fn end_session(&mut self, now: i64) -> Option<i64> {
        let start = self.last_session_start.take()?;
        let duration = session_duration(start, now);
        self.total_seconds = self.total_seconds.saturating_add(duration);
        self.session_count = self.session_count.saturating_add(1);
        self.last_session_duration = Some(duration);
        Some(duration)
    }
}

pub fn session_duration(start: i64, end: i64) -> i64 {
    end.saturating_sub(start).clamp(0, MAX_SESSION_SECS)
}

/// Other devices add their own sessions to the server total, so the larger
/// of the local total and the server total plus this session wins.
pub fn merged_total(local_total: i64, server_seconds: i64, session_secs: i64) -> i64 {
    local_total.max(server_seconds.saturating_add(session_secs))
}

/// JSON body stored in the playtime note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaytimeNote {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl PlaytimeNote {
    /// `None` for empty, malformed or non-object content.
    pub fn parse(content: Option<&str>) -> Option<Self> {
        let content = content.filter(|content| !content.trim().is_empty())?;
        let value: serde_json::Value = serde_json::from_str(content).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub duration_secs: i64,
    pub total_seconds: i64,
    pub session_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaytimeSummary {
    pub local_seconds: i64,
    pub server_seconds: i64,
    pub total_seconds: i64,
    pub session_count: u32,
}

#[derive(Clone)]
pub struct PlaytimeTracker {
    client: RommClient,
    store: SyncStore,
}

impl PlaytimeTracker {
    pub fn new(client: RommClient, store: SyncStore) -> Self {
        Self { client, store }
    }

    /// Starting again before an end replaces the previous start.
    pub async fn record_session_start(&self, rom_id: i64, now: i64) -> Result<(), StoreError> {
        let mut entry = self
            .store
            .playtime(rom_id)
            .await?
            .unwrap_or_else(|| PlaytimeEntry::new(rom_id));
        entry.last_session_start = Some(now);
        self.store.save_playtime(&entry, now).await?;
        tracing::debug!(rom_id, "play session started");
        Ok(())
    }

    /// Credits the running session locally, then merges the total into the
    /// server note. Server trouble never undoes the local record.
    pub async fn record_session_end(
        &self,
        rom_id: i64,
        now: i64,
        device_name: &str,
    ) -> Result<Option<SessionSummary>, StoreError> {
        let Some(mut entry) = self.store.playtime(rom_id).await? else {
            return Ok(None);
        };
        let Some(duration_secs) = entry.end_session(now) else {
            return Ok(None);
        };
        self.store.save_playtime(&entry, now).await?;
        tracing::info!(
            rom_id,
            duration_secs,
            total_seconds = entry.total_seconds,
            "play session recorded"
        );

        let total_seconds = self
            .push_to_server(rom_id, duration_secs, device_name, now)
            .await?
            .unwrap_or(entry.total_seconds);
        Ok(Some(SessionSummary {
            duration_secs,
            total_seconds,
            session_count: entry.session_count,
        }))
    }

    /// Writes the merged total to the server note and adopts it locally.
    /// Returns the merged total, or `None` when the server could not be
    /// reached or there is nothing to sync.
    pub async fn push_to_server(
        &self,
        rom_id: i64,
        session_secs: i64,
        device_name: &str,
        now: i64,
    ) -> Result<Option<i64>, StoreError> {
        let Some(mut entry) = self.store.playtime(rom_id).await? else {
            return Ok(None);
        };
        let note = match self.find_note(rom_id).await {
            Ok(note) => note,
            Err(err) => {
                tracing::warn!(rom_id, error = %err, "playtime not synced, server unavailable");
                return Ok(None);
            }
        };
        let server_seconds = note
            .as_ref()
            .and_then(|note| PlaytimeNote::parse(note.content.as_deref()))
            .map_or(0, |parsed| parsed.seconds);
        let merged = merged_total(entry.total_seconds, server_seconds, session_secs);

        let body = PlaytimeNote {
            seconds: merged,
            updated: OffsetDateTime::from_unix_timestamp(now)
                .ok()
                .and_then(|stamp| stamp.format(&Rfc3339).ok()),
            device: Some(device_name.to_string()),
        };
        let content = match serde_json::to_string(&body) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(rom_id, error = %err, "failed to encode playtime note");
                return Ok(None);
            }
        };

        if entry.total_seconds != merged {
            entry.total_seconds = merged;
            self.store.save_playtime(&entry, now).await?;
        }

        let written = match &note {
            Some(note) => self
                .client
                .update_note(rom_id, note.id, &content)
                .await
                .map(drop),
            None => self
                .client
                .create_note(
                    rom_id,
                    &NewRomNote {
                        title: PLAYTIME_NOTE_TITLE.to_string(),
                        content,
                        is_public: false,
                        tags: vec![PLAYTIME_NOTE_TAG.to_string()],
                    },
                )
                .await
                .map(drop),
        };
        if let Err(err) = written {
            tracing::warn!(rom_id, error = %err, "failed to write playtime note");
            return Ok(None);
        }
        tracing::debug!(rom_id, seconds = merged, "playtime synced to server");
        Ok(Some(merged))
    }

    /// Local and server playtime side by side. An unreachable server counts
    /// as zero server seconds.
    pub async fn summary(&self, rom_id: i64) -> Result<PlaytimeSummary, StoreError> {
        let entry = self.store.playtime(rom_id).await?;
        let server_seconds = match self.find_note(rom_id).await {
            Ok(note) => note
                .and_then(|note| PlaytimeNote::parse(note.content.as_deref()))
                .map_or(0, |parsed| parsed.seconds),
            Err(err) => {
                tracing::debug!(rom_id, error = %err, "server playtime unavailable");
                0
            }
        };
        let local_seconds = entry.as_ref().map_or(0, |entry| entry.total_seconds);
        Ok(PlaytimeSummary {
            local_seconds,
            server_seconds,
            total_seconds: local_seconds.max(server_seconds),
            session_count: entry.map_or(0, |entry| entry.session_count),
        })
    }

    async fn find_note(&self, rom_id: i64) -> Result<Option<RomNote>, RommError> {
        let notes = self
            .client
            .list_notes(rom_id, Some(PLAYTIME_NOTE_TAG))
            .await?;
        Ok(notes
            .into_iter()
            .find(|note| note.title == PLAYTIME_NOTE_TITLE))
    }
}
