use std::io;
use std::path::Path;

use futures_util::StreamExt;
use md5::Context;
use romm_core::{RommClient, RommError, SaveInfo, SaveUpload};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;

use super::paths::{PathError, backup_path_for, partial_path};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] RommError),
    #[error("download stream failed: {0}")]
    Stream(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("nothing to transfer: {0}")]
    MissingSource(String),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    /// The server refused the write because its copy changed underneath us.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TransferError::Api(err) if err.is_conflict())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedSave {
    pub hash: String,
    pub modified: i64,
    pub backup: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedSave {
    pub info: SaveInfo,
    pub hash: String,
}

#[derive(Clone)]
pub struct SaveTransfer {
    client: RommClient,
    emulator: String,
}

impl SaveTransfer {
    pub fn new(client: RommClient, emulator: impl Into<String>) -> Self {
        Self {
            client,
            emulator: emulator.into(),
        }
    }

    /// Streams the save into `<target>.partial`, verifies it against
    /// `expected_md5` when the server reported one, backs up any existing
    /// file and only then moves the new content into place.
    pub async fn download_to_path(
        &self,
        save_id: i64,
        target: &Path,
        expected_md5: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<DownloadedSave, TransferError> {
        let response = self.client.download_save(save_id, device_id).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = Context::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            md5.consume(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual_md5 = format!("{:x}", md5.compute());
        if let Some(expected_md5) = expected_md5.filter(|hash| !hash.is_empty()) {
            let expected_md5 = expected_md5.to_ascii_lowercase();
            if actual_md5 != expected_md5 {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected_md5,
                    actual_md5,
                });
            }
        }

        let backup = backup_existing(target).await?;
        tokio::fs::rename(&partial, target).await?;
        let metadata = tokio::fs::metadata(target).await?;
        let modified = super::local_saves::modified_unix(&metadata)?;

        Ok(DownloadedSave {
            hash: actual_md5,
            modified,
            backup,
        })
    }

    /// Uploads the file at `source`. With `save_id` the server copy is
    /// replaced in place, otherwise a new save is created for the ROM.
    pub async fn upload_from_path(
        &self,
        rom_id: i64,
        source: &Path,
        filename: &str,
        save_id: Option<i64>,
        device_id: Option<&str>,
    ) -> Result<UploadedSave, TransferError> {
        let content = tokio::fs::read(source).await?;
        let hash = format!("{:x}", md5::compute(&content));
        let info = self
            .client
            .upload_save(SaveUpload {
                rom_id,
                emulator: self.emulator.clone(),
                file_name: filename.to_string(),
                content,
                save_id,
                device_id: device_id.map(str::to_string),
            })
            .await?;
        Ok(UploadedSave { info, hash })
    }
}

async fn backup_existing(target: &Path) -> Result<Option<std::path::PathBuf>, TransferError> {
    if !tokio::fs::try_exists(target).await? {
        return Ok(None);
    }
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .map_err(io::Error::other)?;
    let backup = backup_path_for(target, &stamp);
    if let Some(parent) = backup.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(target, &backup).await?;
    Ok(Some(backup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transfer_for(server: &MockServer) -> SaveTransfer {
        SaveTransfer::new(
            RommClient::new(&server.uri(), "user", "pass").unwrap(),
            "retroarch",
        )
    }

    #[tokio::test]
    async fn downloads_save_to_target_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/saves/100/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("gba/pokemon.srm");

        let downloaded = transfer_for(&server)
            .download_to_path(100, &target, None, None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert_eq!(downloaded.hash, format!("{:x}", md5::compute(b"hello")));
        assert_eq!(downloaded.backup, None);
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_existing_save() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/saves/100/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupt"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("pokemon.srm");
        std::fs::write(&target, b"original").unwrap();

        let err = transfer_for(&server)
            .download_to_path(100, &target, Some("00000000000000000000000000000000"), None)
            .await
            .expect_err("expected integrity failure");

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert!(!partial_path(&target).exists());
        assert!(!dir.path().join(".romm-backup").exists());
    }

    #[tokio::test]
    async fn overwriting_download_backs_up_previous_save() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/saves/100/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new server save data"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("pokemon.srm");
        std::fs::write(&target, b"original save data").unwrap();
        let expected = format!("{:x}", md5::compute(b"new server save data"));

        let downloaded = transfer_for(&server)
            .download_to_path(100, &target, Some(&expected), Some("dev-1"))
            .await
            .unwrap();

        let backup = downloaded.backup.expect("backup created");
        assert!(backup.starts_with(dir.path().join(".romm-backup")));
        assert_eq!(std::fs::read(&backup).unwrap(), b"original save data");
        assert_eq!(std::fs::read(&target).unwrap(), b"new server save data");
    }

    #[tokio::test]
    async fn uploads_file_contents_as_new_save() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/saves"))
            .and(query_param("rom_id", "42"))
            .and(query_param("emulator", "retroarch"))
            .and(body_string_contains("payload"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 200,
                "rom_id": 42,
                "file_name": "pokemon.srm",
                "updated_at": "2026-02-17T15:00:00Z"
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("pokemon.srm");
        std::fs::write(&source, b"payload").unwrap();

        let uploaded = transfer_for(&server)
            .upload_from_path(42, &source, "pokemon.srm", None, None)
            .await
            .unwrap();

        assert_eq!(uploaded.info.id, 200);
        assert_eq!(uploaded.hash, format!("{:x}", md5::compute(b"payload")));
    }

    #[tokio::test]
    async fn upload_conflict_is_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/saves/100"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("pokemon.srm");
        std::fs::write(&source, b"payload").unwrap();

        let err = transfer_for(&server)
            .upload_from_path(42, &source, "pokemon.srm", Some(100), None)
            .await
            .expect_err("expected conflict");

        assert!(err.is_conflict());
    }
}
