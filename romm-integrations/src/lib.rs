pub mod ids;

use serde::{Deserialize, Serialize};

/// Per-file classification reported by the daemon's save status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveFileStatus {
    Synced,
    LocalOnly,
    RemoteOnly,
    LocalNewer,
    RemoteNewer,
    Conflict,
    Unknown,
}

impl SaveFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveFileStatus::Synced => "synced",
            SaveFileStatus::LocalOnly => "local_only",
            SaveFileStatus::RemoteOnly => "remote_only",
            SaveFileStatus::LocalNewer => "local_newer",
            SaveFileStatus::RemoteNewer => "remote_newer",
            SaveFileStatus::Conflict => "conflict",
            SaveFileStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(SaveFileStatus::Synced),
            "local_only" => Some(SaveFileStatus::LocalOnly),
            "remote_only" => Some(SaveFileStatus::RemoteOnly),
            "local_newer" => Some(SaveFileStatus::LocalNewer),
            "remote_newer" => Some(SaveFileStatus::RemoteNewer),
            "conflict" => Some(SaveFileStatus::Conflict),
            "unknown" => Some(SaveFileStatus::Unknown),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SaveFileStatus::Synced => "In sync",
            SaveFileStatus::LocalOnly => "Not uploaded yet",
            SaveFileStatus::RemoteOnly => "Only on server",
            SaveFileStatus::LocalNewer => "Local changes pending",
            SaveFileStatus::RemoteNewer => "Server has newer save",
            SaveFileStatus::Conflict => "Conflict",
            SaveFileStatus::Unknown => "Server unreachable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in [
            SaveFileStatus::Synced,
            SaveFileStatus::LocalOnly,
            SaveFileStatus::RemoteOnly,
            SaveFileStatus::LocalNewer,
            SaveFileStatus::RemoteNewer,
            SaveFileStatus::Conflict,
            SaveFileStatus::Unknown,
        ] {
            assert_eq!(SaveFileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SaveFileStatus::parse("cloud_only"), None);
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&SaveFileStatus::RemoteNewer).unwrap();
        assert_eq!(json, "\"remote_newer\"");
    }

    #[test]
    fn error_names_live_under_interface() {
        for name in [
            ids::DBUS_ERROR_NOT_FOUND,
            ids::DBUS_ERROR_BUSY,
            ids::DBUS_ERROR_INVALID_ARGUMENT,
            ids::DBUS_ERROR_TRANSFER_FAILED,
            ids::DBUS_ERROR_FAILED,
        ] {
            assert!(name.starts_with(ids::DBUS_INTERFACE_SAVE_SYNC));
        }
    }
}
