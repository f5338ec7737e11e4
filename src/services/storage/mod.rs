//! Object storage gateway.
//!
//! Every component that touches blobs is coded against [`ObjectStorage`]; the
//! concrete backend (S3 or the in-memory mock) is chosen once at startup by
//! [`create_storage`] and shared as an `Arc<dyn ObjectStorage>`.

pub mod keys;
pub mod mock;
pub mod s3;

use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashSet, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    config::AppConfig,
    models::upload::PartEtag,
    services::relay_service::{HttpPartTransport, PartTransport},
};

pub use mock::MockStorage;
pub use s3::S3Storage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    /// Backend unreachable or throttling; safe to retry later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Completion manifest does not reconcile with the uploaded parts.
    #[error("multipart integrity violation: {0}")]
    Integrity(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Result of opening a multipart upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInit {
    pub upload_id: String,
    pub key: String,
    /// Presigned part URLs, index `i` is part number `i + 1`.
    pub part_urls: Vec<String>,
}

/// Per-key outcome of a multi-object delete. All keys are attempted.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open a multipart upload under a fresh key and presign `part_count`
    /// part URLs, ordered by part number.
    async fn init_multipart_upload(
        &self,
        file_name: &str,
        file_size: u64,
        content_type: &str,
        part_count: u32,
    ) -> StorageResult<MultipartInit>;

    /// Assemble the object. Parts may arrive in any order; duplicates or
    /// gaps fail with [`StorageError::Integrity`].
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> StorageResult<()>;

    /// Release an unfinished upload. Aborting twice is not an error.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Time-bounded, read-only URL for a single object.
    async fn download_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Remove every version of `key`. Deleting a missing object succeeds.
    async fn delete_file(&self, key: &str) -> StorageResult<()>;

    /// Delete many objects, attempting every key even after failures.
    async fn delete_files(&self, keys: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for key in keys {
            match self.delete_file(key).await {
                Ok(()) => report.deleted.push(key.clone()),
                Err(err) => report.failed.push((key.clone(), err)),
            }
        }
        report
    }

    /// Short backend name for logs and readiness output.
    fn backend_name(&self) -> &'static str;
}

/// Sort a completion manifest by part number and require it to cover
/// `1..=n` exactly once.
pub fn normalize_parts(parts: &[PartEtag]) -> StorageResult<Vec<PartEtag>> {
    if parts.is_empty() {
        return Err(StorageError::Integrity("no parts supplied".into()));
    }

    let mut sorted = parts.to_vec();
    sorted.sort_by_key(|p| p.part_number);

    let mut seen = HashSet::with_capacity(sorted.len());
    for (idx, part) in sorted.iter().enumerate() {
        if part.etag.trim().is_empty() {
            return Err(StorageError::Integrity(format!(
                "part {} has an empty ETag",
                part.part_number
            )));
        }
        if !seen.insert(part.part_number) {
            return Err(StorageError::Integrity(format!(
                "duplicate part number {}",
                part.part_number
            )));
        }
        let expected = idx as u32 + 1;
        if part.part_number != expected {
            return Err(StorageError::Integrity(format!(
                "missing part {} (next supplied part is {})",
                expected, part.part_number
            )));
        }
    }

    Ok(sorted)
}

/// Part uploads through the relay time out after this long.
const RELAY_TIMEOUT: Duration = Duration::from_secs(300);

/// The object store plus the transport the part relay uses to reach it.
#[derive(Clone)]
pub struct StorageBackends {
    pub storage: Arc<dyn ObjectStorage>,
    pub transport: Arc<dyn PartTransport>,
}

/// Build the storage backend selected by configuration.
pub async fn create_storage(config: &AppConfig) -> StorageResult<StorageBackends> {
    if config.storage.mock {
        tracing::info!(bucket = %config.storage.bucket, "using in-memory mock storage");
        let mock = Arc::new(MockStorage::new(
            config.storage.bucket.clone(),
            config.uploads.part_url_ttl,
        ));
        return Ok(StorageBackends {
            storage: mock.clone(),
            transport: mock,
        });
    }

    if config.storage.bucket.is_empty() {
        return Err(StorageError::Config("S3 bucket not configured".into()));
    }

    let storage = S3Storage::new(
        config.storage.bucket.clone(),
        config.storage.region.clone(),
        config.storage.endpoint.clone(),
        config.uploads.part_url_ttl,
    )
    .await?;
    let transport = HttpPartTransport::new(
        config.storage.bucket.clone(),
        config.storage.endpoint.as_deref(),
        RELAY_TIMEOUT,
    )
    .map_err(|e| StorageError::Config(e.to_string()))?;

    Ok(StorageBackends {
        storage: Arc::new(storage),
        transport: Arc::new(transport),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(numbers: &[u32]) -> Vec<PartEtag> {
        numbers
            .iter()
            .map(|n| PartEtag::new(*n, format!("\"etag-{}\"", n)))
            .collect()
    }

    #[test]
    fn unsorted_manifest_is_sorted() {
        let sorted = normalize_parts(&parts(&[3, 1, 4, 2])).unwrap();
        let numbers: Vec<u32> = sorted.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(sorted, normalize_parts(&parts(&[1, 2, 3, 4])).unwrap());
    }

    #[test]
    fn duplicate_part_is_rejected() {
        let err = normalize_parts(&parts(&[1, 2, 2, 3, 4])).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn gap_is_rejected() {
        let err = normalize_parts(&parts(&[1, 3])).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(msg) if msg.contains("missing part 2")));
    }

    #[test]
    fn part_zero_and_empty_manifest_are_rejected() {
        assert!(normalize_parts(&parts(&[0, 1])).is_err());
        assert!(normalize_parts(&[]).is_err());
    }

    #[tokio::test]
    async fn delete_files_attempts_every_key() {
        let storage = MockStorage::new("bucket", Duration::from_secs(60));
        for key in ["a", "b", "c"] {
            storage.put_object(key, 10);
        }
        storage.fail_deletes_for(["b"]);

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let report = storage.delete_files(&keys).await;

        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(!storage.object_exists("a"));
        assert!(storage.object_exists("b"));
        assert!(!storage.object_exists("c"));
    }
}
