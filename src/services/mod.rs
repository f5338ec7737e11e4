pub mod cleanup_service;
pub mod mailer;
pub mod notification_service;
pub mod relay_service;
pub mod storage;
pub mod transfer_service;
pub mod upload_service;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use sqlx::SqlitePool;
    use uuid::Uuid;

    use crate::{
        auth::Owner,
        models::upload::UploadStatus,
        services::storage::{MockStorage, keys::generate_storage_key},
    };

    /// Record a completed upload for `owner` and put its object in the mock
    /// store, skipping the part round trip.
    pub async fn seed_completed_upload(
        db: &SqlitePool,
        storage: &MockStorage,
        owner: &Owner,
        file_name: &str,
        size: i64,
    ) -> String {
        let key = generate_storage_key(file_name);
        sqlx::query(
            "INSERT INTO upload_sessions (
                id, upload_id, storage_key, owner_id, file_name, file_size, content_type,
                part_size, part_count, status, transfer_id, created_at, completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, 'application/octet-stream', ?, 1, ?, NULL, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(format!("seed-{}", Uuid::new_v4()))
        .bind(&key)
        .bind(owner.id)
        .bind(file_name)
        .bind(size)
        .bind(size)
        .bind(UploadStatus::Completed)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(db)
        .await
        .expect("seed upload session");
        storage.put_object(&key, size as u64);
        key
    }
}
