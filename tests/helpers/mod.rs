//! Test helpers: build AppState and router for integration tests.
//!
//! Every app gets its own in-memory SQLite database, mock storage and
//! in-memory mailer.

#![allow(dead_code)]

use axum_test::{
    TestRequest, TestResponse, TestServer,
    multipart::{MultipartForm, Part},
};
use bytes::Bytes;
use fileshare::{
    auth::{USER_ID_HEADER, USER_PLAN_HEADER},
    config::AppConfig,
    db, routes,
    services::{mailer::MemoryMailer, storage::MockStorage},
    state::{AppState, MockHarness},
};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub storage: Arc<MockStorage>,
    pub mailer: Arc<MemoryMailer>,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }
}

/// A caller as the upstream auth proxy would present it.
#[derive(Clone, Copy)]
pub struct TestUser {
    pub id: Uuid,
    pub plan: &'static str,
}

impl TestUser {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            plan: "free",
        }
    }

    /// Attach the identity headers to `request`.
    pub fn sign(&self, request: TestRequest) -> TestRequest {
        request
            .add_header(USER_ID_HEADER, self.id.to_string())
            .add_header(USER_PLAN_HEADER, self.plan)
    }
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(AppConfig::for_tests()).await
}

pub async fn setup_test_app_with(config: AppConfig) -> TestApp {
    let pool = db::test_pool().await.expect("test database");
    let MockHarness {
        state,
        storage,
        mailer,
    } = AppState::with_mocks(config, pool);

    let app = routes::routes::routes().with_state(state.clone());
    let server = TestServer::new(app).expect("Failed to create test server");

    TestApp {
        server,
        state,
        storage,
        mailer,
    }
}

/// Deterministic content so part sizes and ETags are reproducible.
pub fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn create_upload(client: &TestServer, user: &TestUser, name: &str, size: usize) -> Value {
    let response = user
        .sign(client.post("/upload/create"))
        .json(&json!({
            "fileName": name,
            "fileSize": size,
            "contentType": "application/octet-stream",
        }))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    response.json()
}

/// Relay form with the metadata fields ahead of `file`, so the handler
/// streams the part.
pub fn part_form(upload: &Value, part_number: usize, data: &[u8]) -> MultipartForm {
    let part_url = upload["partUrls"][part_number - 1].as_str().unwrap();
    MultipartForm::new()
        .add_text("partUrl", part_url)
        .add_text("partNumber", part_number)
        .add_text("uploadId", upload["uploadId"].as_str().unwrap())
        .add_text("key", upload["key"].as_str().unwrap())
        .add_part("file", Part::bytes(Bytes::copy_from_slice(data)).file_name("blob"))
}

pub async fn post_part(client: &TestServer, user: &TestUser, form: MultipartForm) -> TestResponse {
    user.sign(client.post("/upload/parts"))
        .multipart(form)
        .await
}

/// Relay one part through `/upload/parts` and return its ETag.
pub async fn relay_part(
    client: &TestServer,
    user: &TestUser,
    upload: &Value,
    part_number: usize,
    data: &[u8],
) -> String {
    let response = post_part(client, user, part_form(upload, part_number, data)).await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    response.json::<Value>()["etag"].as_str().unwrap().to_string()
}

pub async fn complete_upload(
    client: &TestServer,
    user: &TestUser,
    upload: &Value,
    parts: &[(usize, String)],
) -> TestResponse {
    let parts: Vec<Value> = parts
        .iter()
        .map(|(n, etag)| json!({ "PartNumber": n, "ETag": etag }))
        .collect();
    user.sign(client.post("/upload/complete"))
        .json(&json!({
            "uploadId": upload["uploadId"],
            "key": upload["key"],
            "parts": parts,
        }))
        .await
}

/// Upload `data` end to end and return the finished storage key.
pub async fn upload_file(client: &TestServer, user: &TestUser, name: &str, data: &[u8]) -> String {
    let upload = create_upload(client, user, name, data.len()).await;
    let part_size = upload["partSize"].as_u64().unwrap() as usize;

    let mut parts = Vec::new();
    for (idx, chunk) in data.chunks(part_size).enumerate() {
        let etag = relay_part(client, user, &upload, idx + 1, chunk).await;
        parts.push((idx + 1, etag));
    }
    let response = complete_upload(client, user, &upload, &parts).await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    upload["key"].as_str().unwrap().to_string()
}

pub async fn create_transfer(client: &TestServer, user: &TestUser, body: Value) -> TestResponse {
    user.sign(client.post("/transfers/create")).json(&body).await
}

/// Upload one small file and share it. Returns the creation response body.
pub async fn share_small_file(app: &TestApp, user: &TestUser, password: Option<&str>) -> Value {
    let data = file_bytes(64);
    let key = upload_file(app.client(), user, "notes.txt", &data).await;
    let mut body = json!({
        "files": [{ "key": key, "name": "notes.txt", "size_bytes": data.len(), "content_type": "text/plain" }],
    });
    if let Some(password) = password {
        body["password"] = json!(password);
    }
    let response = create_transfer(app.client(), user, body).await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    response.json()
}
