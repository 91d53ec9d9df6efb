use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const SAVE_FILE_FIELD: &str = "saveFile";

#[derive(Debug, Error)]
pub enum RommError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Conflict,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub timeout: Duration,
    /// Self-hosted RomM instances commonly run behind self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Clone)]
pub struct RommClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
}

/// A save file to send to the server. `save_id` selects an in-place update of
/// an existing server save instead of creating a new one.
#[derive(Debug, Clone)]
pub struct SaveUpload {
    pub rom_id: i64,
    pub emulator: String,
    pub file_name: String,
    pub content: Vec<u8>,
    pub save_id: Option<i64>,
    pub device_id: Option<String>,
}

impl RommClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, RommError> {
        Self::with_options(base_url, username, password, ClientOptions::default())
    }

    pub fn with_options(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, RommError> {
        let http = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn heartbeat(&self) -> Result<Heartbeat, RommError> {
        let url = self.endpoint("api/heartbeat")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Lists the server saves attached to a ROM. RomM answers either with a
    /// plain array or with a paginated `{"items": [...]}` envelope.
    pub async fn list_saves(
        &self,
        rom_id: i64,
        device_id: Option<&str>,
    ) -> Result<Vec<SaveInfo>, RommError> {
        let mut url = self.endpoint("api/saves")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("rom_id", &rom_id.to_string());
            if let Some(device_id) = device_id {
                query.append_pair("device_id", device_id);
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        let payload: SaveListResponse = Self::handle_response(response).await?;
        Ok(payload.into_items())
    }

    pub async fn get_save(&self, save_id: i64) -> Result<SaveInfo, RommError> {
        let url = self.endpoint(&format!("api/saves/{save_id}"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn upload_save(&self, upload: SaveUpload) -> Result<SaveInfo, RommError> {
        let part = Part::bytes(upload.content)
            .file_name(upload.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(SAVE_FILE_FIELD, part);

        let request = match upload.save_id {
            Some(save_id) => {
                let mut url = self.endpoint(&format!("api/saves/{save_id}"))?;
                if let Some(device_id) = upload.device_id.as_deref() {
                    url.query_pairs_mut().append_pair("device_id", device_id);
                }
                self.http.put(url)
            }
            None => {
                let mut url = self.endpoint("api/saves")?;
                {
                    let mut query = url.query_pairs_mut();
                    query
                        .append_pair("rom_id", &upload.rom_id.to_string())
                        .append_pair("emulator", &upload.emulator);
                    if let Some(device_id) = upload.device_id.as_deref() {
                        query.append_pair("device_id", device_id);
                    }
                }
                self.http.post(url)
            }
        };

        let response = self.authorized(request).multipart(form).send().await?;
        Self::handle_response(response).await
    }

    /// Starts a streaming download of a save's content. The caller owns the
    /// body and decides where it lands on disk.
    pub async fn download_save(
        &self,
        save_id: i64,
        device_id: Option<&str>,
    ) -> Result<reqwest::Response, RommError> {
        let mut url = self.endpoint(&format!("api/saves/{save_id}/content"))?;
        if let Some(device_id) = device_id {
            url.query_pairs_mut().append_pair("device_id", device_id);
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RommError::Api { status, body })
        }
    }

    /// Notes attached to a ROM, optionally narrowed to one tag.
    pub async fn list_notes(&self, rom_id: i64, tag: Option<&str>) -> Result<Vec<RomNote>, RommError> {
        let mut url = self.endpoint(&format!("api/roms/{rom_id}/notes"))?;
        if let Some(tag) = tag {
            url.query_pairs_mut().append_pair("tags", tag);
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        let payload: NoteListResponse = Self::handle_response(response).await?;
        Ok(payload.into_items())
    }

    pub async fn create_note(&self, rom_id: i64, note: &NewRomNote) -> Result<RomNote, RommError> {
        let url = self.endpoint(&format!("api/roms/{rom_id}/notes"))?;
        let response = self
            .authorized(self.http.post(url))
            .json(note)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_note(
        &self,
        rom_id: i64,
        note_id: i64,
        content: &str,
    ) -> Result<RomNote, RommError> {
        let url = self.endpoint(&format!("api/roms/{rom_id}/notes/{note_id}"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(&NoteContentUpdate { content })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    fn endpoint(&self, path: &str) -> Result<Url, RommError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RommError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RommError::Api { status, body })
        }
    }
}

impl RommError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RommError::Api { status, .. } => Some(*status),
            RommError::Request(err) => err.status(),
            RommError::Url(_) => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        self.status().map(classify_api_status)
    }

    /// Server errors, throttling and network-level failures are worth another
    /// attempt; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RommError::Request(err) if err.status().is_none() => {
                err.is_connect() || err.is_timeout()
            }
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Conflict)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::Conflict
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, url::ParseError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    Url::parse(&format!("{trimmed}/"))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SaveInfo {
    pub id: i64,
    #[serde(default)]
    pub rom_id: i64,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
    #[serde(default)]
    pub emulator: Option<String>,
}

impl SaveInfo {
    /// The server hash, or `None` when the server reported an empty one.
    pub fn hash(&self) -> Option<&str> {
        self.content_hash.as_deref().filter(|hash| !hash.is_empty())
    }

    pub fn modified_at(&self) -> Option<&str> {
        self.updated_at.as_deref().or(self.created_at.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SaveListResponse {
    Plain(Vec<SaveInfo>),
    Paged { items: Vec<SaveInfo> },
}

impl SaveListResponse {
    fn into_items(self) -> Vec<SaveInfo> {
        match self {
            SaveListResponse::Plain(items) => items,
            SaveListResponse::Paged { items } => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RomNote {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewRomNote {
    pub title: String,
    pub content: String,
    pub is_public: bool,
    pub tags: Vec<String>,
}

#[derive(Serialize)]
struct NoteContentUpdate<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NoteListResponse {
    Plain(Vec<RomNote>),
    Paged { items: Vec<RomNote> },
}

impl NoteListResponse {
    fn into_items(self) -> Vec<RomNote> {
        match self {
            NoteListResponse::Plain(items) => items,
            NoteListResponse::Paged { items } => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Heartbeat {
    #[serde(rename = "SYSTEM", default)]
    pub system: Option<HeartbeatSystem>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HeartbeatSystem {
    #[serde(rename = "VERSION", default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_sub_path() {
        let url = normalize_base_url("https://example.com/romm/").unwrap();
        assert_eq!(
            url.join("api/saves").unwrap().as_str(),
            "https://example.com/romm/api/saves"
        );
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn api_errors_report_retryability() {
        for code in [500u16, 502, 503, 429, 408] {
            let err = RommError::Api {
                status: StatusCode::from_u16(code).unwrap(),
                body: String::new(),
            };
            assert!(err.is_retryable(), "{code} should be retryable");
        }
        for code in [400u16, 401, 403, 404, 409] {
            let err = RommError::Api {
                status: StatusCode::from_u16(code).unwrap(),
                body: String::new(),
            };
            assert!(!err.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn empty_server_hash_is_treated_as_missing() {
        let save = SaveInfo {
            id: 1,
            rom_id: 42,
            file_name: "pokemon.srm".into(),
            content_hash: Some(String::new()),
            updated_at: None,
            created_at: Some("2026-02-17T06:00:00Z".into()),
            file_size_bytes: None,
            emulator: None,
        };
        assert_eq!(save.hash(), None);
        assert_eq!(save.modified_at(), Some("2026-02-17T06:00:00Z"));
    }
}
