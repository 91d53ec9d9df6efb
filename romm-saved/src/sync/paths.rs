use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const BACKUP_DIR_NAME: &str = ".romm-backup";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("save file name is empty")]
    Empty,
    #[error("save file name must be a plain file name: {0}")]
    UnsupportedComponent(String),
}

/// Maps a save file name reported by the server into `saves_dir`. Names that
/// would leave the directory are rejected.
pub fn save_path_for(saves_dir: &Path, filename: &str) -> Result<PathBuf, PathError> {
    if filename.is_empty() {
        return Err(PathError::Empty);
    }

    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(saves_dir.join(name)),
        _ => Err(PathError::UnsupportedComponent(filename.to_string())),
    }
}

/// `<dir>/.romm-backup/<stem>_<stamp>.<ext>` for the save at `target`.
pub fn backup_path_for(target: &Path, stamp: &str) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!("{stem}_{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{stamp}"),
    };
    dir.join(BACKUP_DIR_NAME).join(name)
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
