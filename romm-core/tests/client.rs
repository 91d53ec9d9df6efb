use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use romm_core::{NewRomNote, RommClient, SaveUpload};

// "user:pass" in base64.
const BASIC_AUTH: &str = "Basic dXNlcjpwYXNz";

fn client_for(server: &MockServer) -> RommClient {
    RommClient::new(&server.uri(), "user", "pass").unwrap()
}

#[tokio::test]
async fn heartbeat_sends_basic_auth() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/heartbeat"))
        .and(header("authorization", BASIC_AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "SYSTEM": { "VERSION": "3.7.0" }
        })))
        .mount(&server)
        .await;

    let heartbeat = client_for(&server).heartbeat().await.unwrap();

    assert_eq!(
        heartbeat.system.and_then(|s| s.version).as_deref(),
        Some("3.7.0")
    );
}

#[tokio::test]
async fn list_saves_accepts_plain_array() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/saves"))
        .and(query_param("rom_id", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "rom_id": 42, "file_name": "a.srm" },
            { "id": 2, "rom_id": 42, "file_name": "b.srm" }
        ])))
        .mount(&server)
        .await;

    let saves = client_for(&server).list_saves(42, None).await.unwrap();

    assert_eq!(saves.len(), 2);
    assert_eq!(saves[1].file_name, "b.srm");
}

#[tokio::test]
async fn list_saves_accepts_paginated_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/saves"))
        .and(query_param("rom_id", "42"))
        .and(query_param("device_id", "dev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": 1,
                    "rom_id": 42,
                    "file_name": "a.srm",
                    "content_hash": "abc123",
                    "updated_at": "2026-02-17T06:00:00Z"
                }
            ],
            "total": 1
        })))
        .mount(&server)
        .await;

    let saves = client_for(&server)
        .list_saves(42, Some("dev-1"))
        .await
        .unwrap();

    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].hash(), Some("abc123"));
}

#[tokio::test]
async fn list_saves_handles_empty_response() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/saves"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let saves = client_for(&server).list_saves(7, None).await.unwrap();

    assert!(saves.is_empty());
}

#[tokio::test]
async fn upload_new_save_posts_multipart() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/saves"))
        .and(query_param("rom_id", "42"))
        .and(query_param("emulator", "retroarch"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_string_contains("name=\"saveFile\""))
        .and(body_string_contains("filename=\"game (save).srm\""))
        .and(body_string_contains("save data content"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 200,
            "updated_at": "2026-02-17T15:00:00Z"
        })))
        .mount(&server)
        .await;

    let saved = client_for(&server)
        .upload_save(SaveUpload {
            rom_id: 42,
            emulator: "retroarch".into(),
            file_name: "game (save).srm".into(),
            content: b"save data content".to_vec(),
            save_id: None,
            device_id: None,
        })
        .await
        .unwrap();

    assert_eq!(saved.id, 200);
    assert_eq!(saved.modified_at(), Some("2026-02-17T15:00:00Z"));
}

#[tokio::test]
async fn upload_existing_save_uses_put() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/saves/100"))
        .and(query_param("device_id", "dev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 100,
            "rom_id": 42,
            "file_name": "pokemon.srm",
            "updated_at": "2026-02-17T15:00:00Z"
        })))
        .mount(&server)
        .await;

    let saved = client_for(&server)
        .upload_save(SaveUpload {
            rom_id: 42,
            emulator: "retroarch".into(),
            file_name: "pokemon.srm".into(),
            content: vec![0u8; 16],
            save_id: Some(100),
            device_id: Some("dev-1".into()),
        })
        .await
        .unwrap();

    assert_eq!(saved.id, 100);
}

#[tokio::test]
async fn upload_conflict_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/saves"))
        .respond_with(ResponseTemplate::new(409).set_body_string("newer save exists"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .upload_save(SaveUpload {
            rom_id: 42,
            emulator: "retroarch".into(),
            file_name: "pokemon.srm".into(),
            content: vec![1u8; 4],
            save_id: None,
            device_id: None,
        })
        .await
        .expect_err("expected conflict");

    assert!(err.is_conflict());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn download_save_streams_content() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/saves/100/content"))
        .and(header("authorization", BASIC_AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"server save"))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .download_save(100, None)
        .await
        .unwrap();

    assert_eq!(response.bytes().await.unwrap().as_ref(), b"server save");
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/saves/5"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .get_save(5)
        .await
        .expect_err("expected server error");

    assert!(err.is_retryable());
    assert!(err.to_string().contains("maintenance"));
}

#[tokio::test]
async fn connection_errors_are_retryable() {
    // Nothing listens on port 9 on the loopback interface.
    let client = RommClient::new("http://127.0.0.1:9", "user", "pass").unwrap();
    let err = client
        .heartbeat()
        .await
        .expect_err("expected connection error");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn list_notes_filters_by_tag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/roms/42/notes"))
        .and(query_param("tags", "romm-sync"))
        .and(header("authorization", BASIC_AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": 9, "title": "romm-sync:playtime", "content": "{\"seconds\": 60}", "tags": ["romm-sync"] }
            ]
        })))
        .mount(&server)
        .await;

    let notes = client_for(&server)
        .list_notes(42, Some("romm-sync"))
        .await
        .unwrap();

    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].id, 9);
    assert_eq!(notes[0].title, "romm-sync:playtime");
    assert_eq!(notes[0].content.as_deref(), Some("{\"seconds\": 60}"));
}

#[tokio::test]
async fn create_note_posts_json() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/roms/42/notes"))
        .and(body_json(json!({
            "title": "romm-sync:playtime",
            "content": "{}",
            "is_public": false,
            "tags": ["romm-sync"]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 3, "title": "romm-sync:playtime", "content": "{}"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let note = client_for(&server)
        .create_note(
            42,
            &NewRomNote {
                title: "romm-sync:playtime".into(),
                content: "{}".into(),
                is_public: false,
                tags: vec!["romm-sync".into()],
            },
        )
        .await
        .unwrap();

    assert_eq!(note.id, 3);
    assert!(!note.is_public);
}

#[tokio::test]
async fn update_note_puts_content() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/roms/42/notes/99"))
        .and(body_json(json!({ "content": "{\"seconds\": 200}" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 99, "title": "romm-sync:playtime", "content": "{\"seconds\": 200}"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let note = client_for(&server)
        .update_note(42, 99, "{\"seconds\": 200}")
        .await
        .unwrap();

    assert_eq!(note.id, 99);
}
