//! Represents one physical uploaded file attached to a transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A file whose bytes live in the object store under `storage_key`.
///
/// Rows are only written when the file is attached to a transfer. The
/// `deleted_at` column records that the backing object (all versions) has
/// been removed; a non-active transfer with any row lacking it still has
/// cleanup pending.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileObject {
    pub id: Uuid,

    /// Owning transfer, assigned at transfer creation.
    pub transfer_id: Uuid,

    /// Opaque object-store key produced by the upload session.
    pub storage_key: String,

    /// Original file name; may carry a relative path for folder uploads.
    pub file_name: String,

    pub size_bytes: i64,

    pub content_type: String,

    pub created_at: DateTime<Utc>,

    pub deleted_at: Option<DateTime<Utc>>,
}

/// Public view of a file: no storage key, no bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileSummary {
    pub id: Uuid,
    pub name: String,
    pub size_bytes: i64,
    pub content_type: String,
}

impl From<&FileObject> for FileSummary {
    fn from(file: &FileObject) -> Self {
        Self {
            id: file.id,
            name: file.file_name.clone(),
            size_bytes: file.size_bytes,
            content_type: file.content_type.clone(),
        }
    }
}
