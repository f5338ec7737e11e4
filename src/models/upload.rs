//! Multipart upload sessions and the part manifests clients submit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Parts may still be uploaded.
    Pending,
    /// Object assembled; the key may be attached to one transfer.
    Completed,
    Aborted,
    /// Attached to a transfer; cannot be attached again.
    Consumed,
    /// Never attached within the grace window; object removed.
    Reaped,
}

/// Server-side record binding an upload's storage key to the user who
/// opened it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    pub id: Uuid,
    pub upload_id: String,
    pub storage_key: String,
    pub owner_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub part_size: i64,
    pub part_count: i64,
    pub status: UploadStatus,
    pub transfer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One uploaded part as reported by the client after PUTting it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartEtag {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,

    #[serde(rename = "ETag")]
    pub etag: String,
}

impl PartEtag {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}
