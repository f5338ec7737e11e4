//! Deterministic in-memory storage backend.
//!
//! Mirrors the S3 behaviours the rest of the service depends on: multipart
//! sessions with md5 part ETags, versioned objects, all-version deletes and
//! expiring `mock://` URLs. Fault injection hooks let tests simulate an
//! unavailable backend or keys that refuse to delete.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rand::RngCore;
use reqwest::Url;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{
    MultipartInit, ObjectStorage, StorageError, StorageResult, keys::generate_storage_key,
    normalize_parts,
};
use crate::{
    models::upload::PartEtag,
    services::relay_service::{PartStream, PartTransport, RelayError},
};

#[derive(Debug)]
struct MockUpload {
    key: String,
    part_count: u32,
    parts: BTreeMap<u32, MockPart>,
}

#[derive(Debug, Clone)]
struct MockPart {
    etag: String,
    size: u64,
}

#[derive(Debug, Clone)]
struct MockVersion {
    version_id: String,
    size: u64,
}

#[derive(Debug, Default)]
struct MockState {
    next_upload: u64,
    next_version: u64,
    uploads: HashMap<String, MockUpload>,
    objects: HashMap<String, Vec<MockVersion>>,
    failing_deletes: HashSet<String>,
    unavailable: bool,
}

impl MockState {
    fn push_version(&mut self, key: &str, size: u64) {
        self.next_version += 1;
        let version = MockVersion {
            version_id: format!("v{}", self.next_version),
            size,
        };
        self.objects.entry(key.to_string()).or_default().push(version);
    }
}

pub struct MockStorage {
    bucket: String,
    part_url_ttl: Duration,
    state: Mutex<MockState>,
}

impl MockStorage {
    pub fn new(bucket: impl Into<String>, part_url_ttl: Duration) -> Self {
        Self {
            bucket: bucket.into(),
            part_url_ttl,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry_after(ttl: Duration) -> i64 {
        Utc::now().timestamp() + ttl.as_secs() as i64
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.state().unavailable {
            Err(StorageError::Unavailable("mock backend offline".into()))
        } else {
            Ok(())
        }
    }

    /// Simulate an outage: every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make deletes of these keys fail until cleared.
    pub fn fail_deletes_for<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.failing_deletes.extend(keys.into_iter().map(Into::into));
    }

    pub fn clear_delete_failures(&self) {
        self.state().failing_deletes.clear();
    }

    /// Seed an object version directly, bypassing the multipart flow.
    pub fn put_object(&self, key: &str, size: u64) {
        self.state().push_version(key, size);
    }

    pub fn object_exists(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    pub fn object_size(&self, key: &str) -> Option<u64> {
        self.state()
            .objects
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| v.size)
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.state().objects.get(key).map_or(0, Vec::len)
    }

    pub fn open_upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    fn part_url(&self, key: &str, upload_id: &str, part_number: u32, expires: i64) -> String {
        format!(
            "mock://{}/{}?uploadId={}&partNumber={}&expires={}",
            self.bucket, key, upload_id, part_number, expires
        )
    }
}

#[async_trait]
impl ObjectStorage for MockStorage {
    async fn init_multipart_upload(
        &self,
        file_name: &str,
        _file_size: u64,
        _content_type: &str,
        part_count: u32,
    ) -> StorageResult<MultipartInit> {
        self.check_available()?;
        if part_count == 0 {
            return Err(StorageError::Integrity("part count must be positive".into()));
        }

        let key = generate_storage_key(file_name);
        let upload_id = {
            let mut state = self.state();
            state.next_upload += 1;
            let upload_id = format!("mock-upload-{:06}", state.next_upload);
            state.uploads.insert(
                upload_id.clone(),
                MockUpload {
                    key: key.clone(),
                    part_count,
                    parts: BTreeMap::new(),
                },
            );
            upload_id
        };

        let expires = Self::expiry_after(self.part_url_ttl);
        let part_urls = (1..=part_count)
            .map(|n| self.part_url(&key, &upload_id, n, expires))
            .collect();

        Ok(MultipartInit {
            upload_id,
            key,
            part_urls,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> StorageResult<()> {
        self.check_available()?;
        let parts = normalize_parts(parts)?;

        let mut state = self.state();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| StorageError::Integrity(format!("no such upload `{}`", upload_id)))?;
        if upload.key != key {
            return Err(StorageError::Integrity(
                "upload id does not belong to key".into(),
            ));
        }

        let mut size = 0u64;
        for part in &parts {
            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::Integrity(format!("part {} was never uploaded", part.part_number))
            })?;
            if stored.etag.trim_matches('"') != part.etag.trim_matches('"') {
                return Err(StorageError::Integrity(format!(
                    "ETag mismatch for part {}",
                    part.part_number
                )));
            }
            size += stored.size;
        }

        state.uploads.remove(upload_id);
        state.push_version(key, size);
        tracing::debug!(key = %key, size_bytes = size, "mock multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state();
        let matches_key = state
            .uploads
            .get(upload_id)
            .is_some_and(|upload| upload.key == key);
        if matches_key {
            state.uploads.remove(upload_id);
        }
        Ok(())
    }

    async fn download_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.check_available()?;
        if !self.object_exists(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let mut nonce = [0u8; 8];
        rand::rng().fill_bytes(&mut nonce);
        let nonce: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(format!(
            "mock://{}/{}?expires={}&nonce={}",
            self.bucket,
            key,
            Self::expiry_after(expires_in),
            nonce
        ))
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state();
        if state.failing_deletes.contains(key) {
            return Err(StorageError::Unavailable(format!(
                "injected delete failure for `{}`",
                key
            )));
        }
        if let Some(versions) = state.objects.remove(key) {
            let ids: Vec<&str> = versions.iter().map(|v| v.version_id.as_str()).collect();
            tracing::debug!(key = %key, versions = ?ids, "mock object deleted");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}

#[async_trait]
impl PartTransport for MockStorage {
    fn accepts(&self, url: &Url) -> bool {
        url.scheme() == "mock" && url.host_str() == Some(self.bucket.as_str())
    }

    async fn put_part(
        &self,
        url: &Url,
        content_length: Option<u64>,
        mut body: PartStream,
    ) -> Result<String, RelayError> {
        if self.state().unavailable {
            return Err(RelayError::Upstream {
                status: 503,
                body: "SlowDown".into(),
            });
        }

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let expires: i64 = query
            .get("expires")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if Utc::now().timestamp() >= expires {
            return Err(RelayError::Upstream {
                status: 403,
                body: "Request has expired".into(),
            });
        }
        let upload_id = query.get("uploadId").cloned().unwrap_or_default();
        let part_number: u32 = query
            .get("partNumber")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let key = url.path().trim_start_matches('/').to_string();

        {
            let state = self.state();
            let upload = state.uploads.get(&upload_id).ok_or(RelayError::Upstream {
                status: 404,
                body: "NoSuchUpload".into(),
            })?;
            if upload.key != key || part_number == 0 || part_number > upload.part_count {
                return Err(RelayError::Upstream {
                    status: 400,
                    body: "InvalidArgument".into(),
                });
            }
        }

        let mut digest = md5::Context::new();
        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| RelayError::Network(err.to_string()))?;
            size += chunk.len() as u64;
            digest.consume(&chunk);
        }
        if content_length.is_some_and(|expected| expected != size) {
            return Err(RelayError::Upstream {
                status: 400,
                body: "IncompleteBody".into(),
            });
        }
        let etag = format!("\"{:x}\"", digest.compute());

        let mut state = self.state();
        let upload = state.uploads.get_mut(&upload_id).ok_or(RelayError::Upstream {
            status: 404,
            body: "NoSuchUpload".into(),
        })?;
        upload.parts.insert(
            part_number,
            MockPart {
                etag: etag.clone(),
                size,
            },
        );
        Ok(etag)
    }
}
