mod helpers;

use axum_test::multipart::{MultipartForm, Part};
use chrono::{DateTime, Duration, Utc};
use fileshare::config::AppConfig;
use helpers::*;
use serde_json::{Value, json};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_upload_share_and_download_end_to_end() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let data = file_bytes(25 * MIB);

    let upload = create_upload(app.client(), &user, "report.pdf", data.len()).await;
    assert_eq!(upload["partCount"], 3);
    assert_eq!(upload["partSize"], 10 * MIB);
    assert_eq!(upload["partUrls"].as_array().unwrap().len(), 3);

    // Parts may arrive in any order.
    let mut parts = Vec::new();
    for number in [3, 1, 2] {
        let start = (number - 1) * 10 * MIB;
        let end = (start + 10 * MIB).min(data.len());
        let etag = relay_part(app.client(), &user, &upload, number, &data[start..end]).await;
        parts.push((number, etag));
    }

    let response = complete_upload(app.client(), &user, &upload, &parts).await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let key = upload["key"].as_str().unwrap().to_string();
    assert_eq!(app.storage.object_size(&key), Some(data.len() as u64));

    let before = Utc::now();
    let response = create_transfer(
        app.client(),
        &user,
        json!({
            "files": [{ "key": key, "name": "report.pdf", "size_bytes": data.len() }],
        }),
    )
    .await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    let created: Value = response.json();
    let slug = created["slug"].as_str().unwrap();
    let expires_at: DateTime<Utc> = created["expires_at"].as_str().unwrap().parse().unwrap();
    assert!(expires_at >= before + Duration::days(7));
    assert!(expires_at <= Utc::now() + Duration::days(7));

    let response = app.client().get(&format!("/share/{}", slug)).await;
    assert_eq!(response.status_code(), 200);
    let meta: Value = response.json();
    assert_eq!(meta["requires_password"], false);
    assert_eq!(meta["files"].as_array().unwrap().len(), 1);
    assert_eq!(meta["files"][0]["size_bytes"], data.len());
    let file_id = meta["files"][0]["id"].as_str().unwrap();

    let url = format!("/share/{}/download?fileId={}", slug, file_id);
    let first: Value = app.client().get(&url).await.json();
    let second: Value = app.client().get(&url).await.json();
    let first = first["downloadUrl"].as_str().unwrap();
    let second = second["downloadUrl"].as_str().unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_part_sent_before_its_metadata_is_buffered() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let data = file_bytes(4096);
    let upload = create_upload(app.client(), &user, "notes.txt", data.len()).await;

    let form = MultipartForm::new()
        .add_part("file", Part::bytes(data.clone()).file_name("notes.txt"))
        .add_text("partUrl", upload["partUrls"][0].as_str().unwrap())
        .add_text("partNumber", 1)
        .add_text("uploadId", upload["uploadId"].as_str().unwrap())
        .add_text("key", upload["key"].as_str().unwrap());
    let response = post_part(app.client(), &user, form).await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let etag = response.json::<Value>()["etag"].as_str().unwrap().to_string();

    let response = complete_upload(app.client(), &user, &upload, &[(1, etag)]).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["success"], true);
}

#[tokio::test]
async fn test_short_part_is_rejected() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let upload = create_upload(app.client(), &user, "a.bin", 2048).await;

    let response = post_part(app.client(), &user, part_form(&upload, 1, &file_bytes(100))).await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["kind"], "validation");
}

#[tokio::test]
async fn test_long_part_is_rejected() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let upload = create_upload(app.client(), &user, "a.bin", 64).await;

    let response = post_part(app.client(), &user, part_form(&upload, 1, &file_bytes(100))).await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["kind"], "validation");
}

#[tokio::test]
async fn test_expired_part_url_is_reported_as_retryable() {
    let mut config = AppConfig::for_tests();
    config.uploads.part_url_ttl = std::time::Duration::ZERO;
    let app = setup_test_app_with(config).await;
    let user = TestUser::new();
    let upload = create_upload(app.client(), &user, "a.bin", 64).await;

    let response = post_part(app.client(), &user, part_form(&upload, 1, &file_bytes(64))).await;
    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["kind"], "url_expired");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_part_url_for_another_upload_is_rejected() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let first = create_upload(app.client(), &user, "a.bin", 64).await;
    let second = create_upload(app.client(), &user, "b.bin", 64).await;

    let form = MultipartForm::new()
        .add_text("partUrl", first["partUrls"][0].as_str().unwrap())
        .add_text("partNumber", 1)
        .add_text("uploadId", second["uploadId"].as_str().unwrap())
        .add_text("key", second["key"].as_str().unwrap())
        .add_part("file", Part::bytes(file_bytes(64)).file_name("b.bin"));
    let response = post_part(app.client(), &user, form).await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_complete_with_missing_part_is_a_conflict() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let data = file_bytes(25 * MIB);
    let upload = create_upload(app.client(), &user, "big.bin", data.len()).await;
    let etag = relay_part(app.client(), &user, &upload, 1, &data[..10 * MIB]).await;

    let response = complete_upload(app.client(), &user, &upload, &[(1, etag)]).await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let app = setup_test_app().await;
    let user = TestUser::new();
    let upload = create_upload(app.client(), &user, "a.bin", 64).await;
    let body = json!({ "uploadId": upload["uploadId"], "key": upload["key"] });

    for _ in 0..2 {
        let response = user.sign(app.client().post("/upload/abort")).json(&body).await;
        assert_eq!(response.status_code(), 200, "{}", response.text());
    }
    assert_eq!(app.storage.open_upload_count(), 0);
}

#[tokio::test]
async fn test_upload_endpoints_require_identity() {
    let app = setup_test_app().await;

    let response = app
        .client()
        .post("/upload/create")
        .json(&json!({ "fileName": "a.bin", "fileSize": 10 }))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = app.client().get("/transfers").await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn test_another_users_upload_cannot_be_completed() {
    let app = setup_test_app().await;
    let owner = TestUser::new();
    let intruder = TestUser::new();
    let data = file_bytes(64);
    let upload = create_upload(app.client(), &owner, "a.bin", data.len()).await;
    let etag = relay_part(app.client(), &owner, &upload, 1, &data).await;

    let response = complete_upload(app.client(), &intruder, &upload, &[(1, etag)]).await;
    assert_eq!(response.status_code(), 403);
}

#[tokio::test]
async fn test_oversized_file_exceeds_plan() {
    let app = setup_test_app().await;
    let user = TestUser::new();

    let response = user
        .sign(app.client().post("/upload/create"))
        .json(&json!({ "fileName": "huge.iso", "fileSize": 3u64 * 1024 * 1024 * 1024 }))
        .await;
    assert_eq!(response.status_code(), 413);
}
