use romm_integrations::SaveFileStatus;

use super::settings::ConflictMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub modified: i64,
    pub hash: Option<String>,
}

impl FileMetadata {
    pub fn new(modified: i64, hash: Option<String>) -> Self {
        Self { modified, hash }
    }
}

/// Last state on which both sides agreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub rom_id: i64,
    pub filename: String,
    pub hash: Option<String>,
    pub local_mtime: Option<i64>,
    pub remote_mtime: Option<i64>,
    pub remote_save_id: Option<i64>,
    pub synced_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Absent,
    InSync,
    LocalOnly,
    RemoteOnly,
    LocalChanged,
    RemoteChanged,
    Diverged,
}

impl SaveState {
    pub fn status(self) -> Option<SaveFileStatus> {
        match self {
            SaveState::Absent => None,
            SaveState::InSync => Some(SaveFileStatus::Synced),
            SaveState::LocalOnly => Some(SaveFileStatus::LocalOnly),
            SaveState::RemoteOnly => Some(SaveFileStatus::RemoteOnly),
            SaveState::LocalChanged => Some(SaveFileStatus::LocalNewer),
            SaveState::RemoteChanged => Some(SaveFileStatus::RemoteNewer),
            SaveState::Diverged => Some(SaveFileStatus::Conflict),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Skip,
    Upload,
    Download,
    AskUser,
}

pub fn classify(
    local: Option<&FileMetadata>,
    remote: Option<&FileMetadata>,
    checkpoint: Option<&SyncCheckpoint>,
) -> SaveState {
    let (local, remote) = match (local, remote) {
        (None, None) => return SaveState::Absent,
        (Some(_), None) => return SaveState::LocalOnly,
        (None, Some(_)) => return SaveState::RemoteOnly,
        (Some(local), Some(remote)) => (local, remote),
    };

    if let (Some(left), Some(right)) = (&local.hash, &remote.hash)
        && left == right
    {
        return SaveState::InSync;
    }

    let Some(checkpoint) = checkpoint else {
        let differ = match (&local.hash, &remote.hash) {
            (Some(left), Some(right)) => left != right,
            _ => local.modified != remote.modified,
        };
        return if differ {
            SaveState::Diverged
        } else {
            SaveState::InSync
        };
    };

    match (
        local_changed_since(local, checkpoint),
        remote_changed_since(remote, checkpoint),
    ) {
        (false, false) => SaveState::InSync,
        (true, false) => SaveState::LocalChanged,
        (false, true) => SaveState::RemoteChanged,
        (true, true) => SaveState::Diverged,
    }
}

pub fn decide(
    local: Option<&FileMetadata>,
    remote: Option<&FileMetadata>,
    checkpoint: Option<&SyncCheckpoint>,
    mode: ConflictMode,
) -> SyncAction {
    match (classify(local, remote, checkpoint), local, remote) {
        (SaveState::Diverged, Some(local), Some(remote)) => resolve_divergence(local, remote, mode),
        (SaveState::LocalOnly | SaveState::LocalChanged, _, _) => SyncAction::Upload,
        (SaveState::RemoteOnly | SaveState::RemoteChanged, _, _) => SyncAction::Download,
        _ => SyncAction::Skip,
    }
}

fn resolve_divergence(local: &FileMetadata, remote: &FileMetadata, mode: ConflictMode) -> SyncAction {
    match mode {
        // Exact ties go to the server copy.
        ConflictMode::NewestWins if local.modified > remote.modified => SyncAction::Upload,
        ConflictMode::NewestWins => SyncAction::Download,
        ConflictMode::AlwaysUpload => SyncAction::Upload,
        ConflictMode::AlwaysDownload => SyncAction::Download,
        ConflictMode::AskMe => SyncAction::AskUser,
    }
}

fn local_changed_since(local: &FileMetadata, checkpoint: &SyncCheckpoint) -> bool {
    match (&local.hash, &checkpoint.hash) {
        (Some(hash), Some(base)) => hash != base,
        _ => newer_than(local.modified, checkpoint.local_mtime),
    }
}

fn remote_changed_since(remote: &FileMetadata, checkpoint: &SyncCheckpoint) -> bool {
    match (&remote.hash, &checkpoint.hash) {
        (Some(hash), Some(base)) if hash != base => true,
        // The server may keep reporting the old hash after an overwrite.
        (Some(_), Some(_)) => checkpoint
            .remote_mtime
            .is_some_and(|base| remote.modified > base),
        _ => newer_than(remote.modified, checkpoint.remote_mtime),
    }
}

fn newer_than(modified: i64, base: Option<i64>) -> bool {
    base.is_none_or(|base| modified > base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(hash: &str, modified: i64) -> FileMetadata {
        FileMetadata::new(modified, Some(hash.to_string()))
    }

    fn stamp(modified: i64) -> FileMetadata {
        FileMetadata::new(modified, None)
    }

    fn checkpoint(hash: Option<&str>, local_mtime: i64, remote_mtime: i64) -> SyncCheckpoint {
        SyncCheckpoint {
            rom_id: 42,
            filename: "pokemon.srm".into(),
            hash: hash.map(str::to_string),
            local_mtime: Some(local_mtime),
            remote_mtime: Some(remote_mtime),
            remote_save_id: Some(100),
            synced_at: remote_mtime,
        }
    }

    #[test]
    fn one_sided_saves_move_towards_missing_side() {
        let local = meta("a", 1);
        assert_eq!(
            decide(Some(&local), None, None, ConflictMode::AskMe),
            SyncAction::Upload
        );
        assert_eq!(
            decide(None, Some(&local), None, ConflictMode::AskMe),
            SyncAction::Download
        );
        assert_eq!(
            decide(None, None, None, ConflictMode::NewestWins),
            SyncAction::Skip
        );
    }

    #[test]
    fn equal_hashes_skip_even_with_different_times() {
        let local = meta("a", 10);
        let remote = meta("a", 99);
        assert_eq!(
            decide(Some(&local), Some(&remote), None, ConflictMode::AskMe),
            SyncAction::Skip
        );
    }

    #[test]
    fn upload_when_only_local_changed() {
        let base = checkpoint(Some("a"), 1, 1);
        let local = meta("b", 2);
        let remote = meta("a", 1);
        assert_eq!(
            classify(Some(&local), Some(&remote), Some(&base)),
            SaveState::LocalChanged
        );
        assert_eq!(
            decide(Some(&local), Some(&remote), Some(&base), ConflictMode::AskMe),
            SyncAction::Upload
        );
    }

    #[test]
    fn download_when_only_remote_changed() {
        let base = checkpoint(Some("a"), 1, 1);
        let local = meta("a", 1);
        let remote = meta("c", 3);
        assert_eq!(
            decide(Some(&local), Some(&remote), Some(&base), ConflictMode::AskMe),
            SyncAction::Download
        );
    }

    #[test]
    fn stale_remote_hash_falls_back_to_server_time() {
        let base = checkpoint(Some("a"), 1, 100);
        let local = meta("b", 2);
        let stale = meta("a", 200);
        assert_eq!(
            classify(Some(&local), Some(&stale), Some(&base)),
            SaveState::Diverged
        );
        let unchanged = meta("a", 100);
        assert_eq!(
            classify(Some(&local), Some(&unchanged), Some(&base)),
            SaveState::LocalChanged
        );
    }

    #[test]
    fn missing_hashes_compare_timestamps_against_checkpoint() {
        let base = checkpoint(None, 10, 20);
        assert_eq!(
            classify(Some(&stamp(10)), Some(&stamp(30)), Some(&base)),
            SaveState::RemoteChanged
        );
        assert_eq!(
            classify(Some(&stamp(15)), Some(&stamp(20)), Some(&base)),
            SaveState::LocalChanged
        );
        assert_eq!(
            classify(Some(&stamp(15)), Some(&stamp(30)), Some(&base)),
            SaveState::Diverged
        );
    }

    #[test]
    fn no_checkpoint_with_different_content_is_a_conflict() {
        let local = meta("b", 2);
        let remote = meta("c", 3);
        assert_eq!(
            classify(Some(&local), Some(&remote), None),
            SaveState::Diverged
        );
        assert_eq!(
            decide(Some(&local), Some(&remote), None, ConflictMode::AskMe),
            SyncAction::AskUser
        );
    }

    #[test]
    fn no_checkpoint_no_hashes_equal_times_is_in_sync() {
        assert_eq!(
            classify(Some(&stamp(5)), Some(&stamp(5)), None),
            SaveState::InSync
        );
    }

    #[test]
    fn newest_wins_prefers_strictly_newer_local() {
        let local = meta("b", 20);
        let remote = meta("c", 10);
        assert_eq!(
            decide(Some(&local), Some(&remote), None, ConflictMode::NewestWins),
            SyncAction::Upload
        );
        assert_eq!(
            decide(Some(&remote), Some(&local), None, ConflictMode::NewestWins),
            SyncAction::Download
        );
    }

    #[test]
    fn newest_wins_tie_downloads() {
        let local = meta("b", 10);
        let remote = meta("c", 10);
        assert_eq!(
            decide(Some(&local), Some(&remote), None, ConflictMode::NewestWins),
            SyncAction::Download
        );
    }

    #[test]
    fn fixed_modes_ignore_timestamps() {
        let local = meta("b", 1);
        let remote = meta("c", 99);
        assert_eq!(
            decide(Some(&local), Some(&remote), None, ConflictMode::AlwaysUpload),
            SyncAction::Upload
        );
        assert_eq!(
            decide(Some(&remote), Some(&local), None, ConflictMode::AlwaysDownload),
            SyncAction::Download
        );
    }

    #[test]
    fn states_map_to_status_vocabulary() {
        assert_eq!(SaveState::Absent.status(), None);
        assert_eq!(SaveState::Diverged.status(), Some(SaveFileStatus::Conflict));
        assert_eq!(
            SaveState::LocalChanged.status(),
            Some(SaveFileStatus::LocalNewer)
        );
    }
}
