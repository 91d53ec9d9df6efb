use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use md5::Context;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;

const SAVE_EXTENSIONS: [&str; 2] = ["srm", "rtc"];
const HASH_CHUNK_SIZE: usize = 64 * 1024;
const RETRODECK_CONFIG: &str = ".var/app/net.retrodeck.retrodeck/config/retrodeck/retrodeck.json";
const RETRODECK_FALLBACK_SAVES: &str = "retrodeck/saves";

#[derive(Debug, Error)]
pub enum LocalSaveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse installed ROM registry {path}: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstalledRom {
    pub rom_id: i64,
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub system: String,
}

impl InstalledRom {
    /// Emulators name saves after the launch file; multi-disc games launch
    /// through an `.m3u` playlist.
    pub fn save_stem(&self) -> Option<String> {
        let launch = Path::new(&self.file_path);
        let from_m3u = launch
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("m3u"))
            .then(|| launch.file_stem())
            .flatten();
        from_m3u
            .or_else(|| Path::new(&self.file_name).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PluginState {
    #[serde(default)]
    installed_roms: HashMap<String, InstalledRom>,
}

/// The plugin's `state.json`, read on every call so installs made by the
/// frontend are seen without a restart.
#[derive(Debug, Clone)]
pub struct RomRegistry {
    state_file: PathBuf,
}

impl RomRegistry {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
        }
    }

    /// Installed ROMs ordered by id. A missing registry means nothing is
    /// installed yet.
    pub async fn installed_roms(&self) -> Result<Vec<InstalledRom>, LocalSaveError> {
        let raw = match tokio::fs::read(&self.state_file).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let state: PluginState =
            serde_json::from_slice(&raw).map_err(|source| LocalSaveError::Registry {
                path: self.state_file.clone(),
                source,
            })?;
        let mut roms: Vec<InstalledRom> = state.installed_roms.into_values().collect();
        roms.sort_by_key(|rom| rom.rom_id);
        Ok(roms)
    }

    pub async fn get(&self, rom_id: i64) -> Result<Option<InstalledRom>, LocalSaveError> {
        Ok(self
            .installed_roms()
            .await?
            .into_iter()
            .find(|rom| rom.rom_id == rom_id))
    }
}

#[derive(Debug, Clone)]
pub enum SavesRoot {
    Fixed(PathBuf),
    RetroDeck { config: PathBuf, fallback: PathBuf },
}

impl SavesRoot {
    pub fn retrodeck(home: &Path) -> Self {
        SavesRoot::RetroDeck {
            config: home.join(RETRODECK_CONFIG),
            fallback: home.join(RETRODECK_FALLBACK_SAVES),
        }
    }

    /// Re-reads RetroDECK's configuration each time; the user may move the
    /// saves folder to an SD card at any point.
    pub fn resolve(&self) -> PathBuf {
        match self {
            SavesRoot::Fixed(path) => path.clone(),
            SavesRoot::RetroDeck { config, fallback } => {
                read_retrodeck_saves_path(config).unwrap_or_else(|| fallback.clone())
            }
        }
    }
}

fn read_retrodeck_saves_path(config: &Path) -> Option<PathBuf> {
    let raw = std::fs::read(config).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value
        .get("paths")?
        .get("saves_path")?
        .as_str()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSave {
    pub filename: String,
    pub path: PathBuf,
    pub modified: i64,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct SaveLocator {
    registry: RomRegistry,
    saves_root: SavesRoot,
}

impl SaveLocator {
    pub fn new(registry: RomRegistry, saves_root: SavesRoot) -> Self {
        Self {
            registry,
            saves_root,
        }
    }

    pub fn registry(&self) -> &RomRegistry {
        &self.registry
    }

    /// `None` when the ROM has no emulator system to file saves under.
    pub fn saves_dir(&self, rom: &InstalledRom) -> Option<PathBuf> {
        if rom.system.is_empty() {
            return None;
        }
        Some(self.saves_root.resolve().join(&rom.system))
    }

    pub async fn discover(&self, rom: &InstalledRom) -> Result<Vec<LocalSave>, LocalSaveError> {
        let (Some(dir), Some(stem)) = (self.saves_dir(rom), rom.save_stem()) else {
            return Ok(Vec::new());
        };
        let mut saves = Vec::new();
        for ext in SAVE_EXTENSIONS {
            let filename = format!("{stem}.{ext}");
            let path = dir.join(&filename);
            if let Some(save) = read_local_save(&path, filename).await? {
                saves.push(save);
            }
        }
        saves.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(saves)
    }
}

/// Metadata and hash of the save at `path`, or `None` if it does not exist.
pub async fn read_local_save(
    path: &Path,
    filename: String,
) -> Result<Option<LocalSave>, LocalSaveError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(LocalSave {
        filename,
        path: path.to_path_buf(),
        modified: modified_unix(&metadata)?,
        hash: file_md5(path).await?,
    }))
}

pub fn modified_unix(metadata: &std::fs::Metadata) -> io::Result<i64> {
    let modified = metadata.modified()?;
    Ok(time::OffsetDateTime::from(modified).unix_timestamp())
}

pub async fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
