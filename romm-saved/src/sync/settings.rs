use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid conflict mode: {0}")]
    InvalidConflictMode(String),
    #[error("malformed settings update: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    #[default]
    NewestWins,
    AlwaysUpload,
    AlwaysDownload,
    AskMe,
}

impl ConflictMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictMode::NewestWins => "newest_wins",
            ConflictMode::AlwaysUpload => "always_upload",
            ConflictMode::AlwaysDownload => "always_download",
            ConflictMode::AskMe => "ask_me",
        }
    }
}

impl FromStr for ConflictMode {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "newest_wins" => Ok(ConflictMode::NewestWins),
            "always_upload" => Ok(ConflictMode::AlwaysUpload),
            "always_download" => Ok(ConflictMode::AlwaysDownload),
            "ask_me" => Ok(ConflictMode::AskMe),
            other => Err(SettingsError::InvalidConflictMode(other.to_string())),
        }
    }
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSyncSettings {
    pub sync_before_launch: bool,
    pub sync_after_exit: bool,
    pub conflict_mode: ConflictMode,
}

impl Default for SaveSyncSettings {
    fn default() -> Self {
        Self {
            sync_before_launch: true,
            sync_after_exit: true,
            conflict_mode: ConflictMode::NewestWins,
        }
    }
}

/// Partial settings change. Keys that are not settings are ignored; the
/// conflict mode is kept as a raw string so that it is validated on apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub sync_before_launch: Option<bool>,
    #[serde(default)]
    pub sync_after_exit: Option<bool>,
    #[serde(default)]
    pub conflict_mode: Option<String>,
}

impl SettingsUpdate {
    pub fn from_json(raw: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(raw).map_err(|err| SettingsError::Malformed(err.to_string()))
    }

    /// Merges the change into `current`. Nothing is returned unless every
    /// provided field is valid.
    pub fn apply_to(&self, current: &SaveSyncSettings) -> Result<SaveSyncSettings, SettingsError> {
        let conflict_mode = match self.conflict_mode.as_deref() {
            Some(raw) => raw.parse()?,
            None => current.conflict_mode,
        };
        Ok(SaveSyncSettings {
            sync_before_launch: self
                .sync_before_launch
                .unwrap_or(current.sync_before_launch),
            sync_after_exit: self.sync_after_exit.unwrap_or(current.sync_after_exit),
            conflict_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_newest_wins_with_both_triggers() {
        let settings = SaveSyncSettings::default();
        assert!(settings.sync_before_launch);
        assert!(settings.sync_after_exit);
        assert_eq!(settings.conflict_mode, ConflictMode::NewestWins);
    }

    #[test]
    fn parses_every_known_mode() {
        for mode in [
            ConflictMode::NewestWins,
            ConflictMode::AlwaysUpload,
            ConflictMode::AlwaysDownload,
            ConflictMode::AskMe,
        ] {
            assert_eq!(mode.as_str().parse::<ConflictMode>().unwrap(), mode);
        }
    }

    #[test]
    fn rejects_unknown_mode() {
        assert_eq!(
            "bogus".parse::<ConflictMode>(),
            Err(SettingsError::InvalidConflictMode("bogus".into()))
        );
    }

    #[test]
    fn update_merges_only_given_fields() {
        let update =
            SettingsUpdate::from_json(r#"{"sync_after_exit": false, "theme": "dark"}"#).unwrap();
        let merged = update.apply_to(&SaveSyncSettings::default()).unwrap();
        assert!(merged.sync_before_launch);
        assert!(!merged.sync_after_exit);
        assert_eq!(merged.conflict_mode, ConflictMode::NewestWins);
    }

    #[test]
    fn invalid_mode_in_update_fails_whole_update() {
        let update = SettingsUpdate::from_json(
            r#"{"sync_before_launch": false, "conflict_mode": "bogus"}"#,
        )
        .unwrap();
        assert!(matches!(
            update.apply_to(&SaveSyncSettings::default()),
            Err(SettingsError::InvalidConflictMode(_))
        ));
    }

    #[test]
    fn non_boolean_toggle_is_malformed() {
        assert!(matches!(
            SettingsUpdate::from_json(r#"{"sync_before_launch": "yes"}"#),
            Err(SettingsError::Malformed(_))
        ));
    }
}
