//! S3 (and S3-compatible) storage backend.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, meta::region::RegionProviderChain, retry::RetryConfig};
use aws_sdk_s3::{
    Client,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use std::time::{Duration, Instant};

use super::{
    MultipartInit, ObjectStorage, StorageError, StorageResult, keys::generate_storage_key,
    normalize_parts,
};
use crate::models::upload::PartEtag;

/// `DeleteObjects` accepts at most this many identifiers per request.
const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    part_url_ttl: Duration,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    /// * `part_url_ttl` - Lifetime of presigned part upload URLs
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        part_url_ttl: Duration,
    ) -> StorageResult<Self> {
        let region_provider =
            RegionProviderChain::first_try(aws_config::Region::new(region.clone()));

        // Retries happen across requests and sweep runs, not inside the gateway.
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(RetryConfig::disabled())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint_url.as_deref() {
            // Path-style addressing is required by MinIO and most S3 clones.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        tracing::info!(
            bucket = %bucket,
            region = %region,
            endpoint = ?endpoint_url,
            "S3 storage initialized"
        );

        Ok(Self {
            client,
            bucket,
            part_url_ttl,
        })
    }

    fn presigning(expires_in: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(expires_in).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Every version and delete marker stored under exactly `key`.
    async fn list_versions(&self, key: &str) -> StorageResult<Vec<(String, Option<String>)>> {
        let mut found = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let page = self
                .client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(key)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("list_object_versions", key, e))?;

            for version in page.versions() {
                if version.key() == Some(key) {
                    found.push((key.to_string(), version.version_id().map(str::to_string)));
                }
            }
            for marker in page.delete_markers() {
                if marker.key() == Some(key) {
                    found.push((key.to_string(), marker.version_id().map(str::to_string)));
                }
            }

            if page.is_truncated() == Some(true) {
                key_marker = page.next_key_marker().map(str::to_string);
                version_marker = page.next_version_id_marker().map(str::to_string);
                if key_marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(found)
    }

    /// Fallback for providers without `ListObjectVersions`.
    async fn delete_current_version(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("delete_object", key, e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn init_multipart_upload(
        &self,
        file_name: &str,
        file_size: u64,
        content_type: &str,
        part_count: u32,
    ) -> StorageResult<MultipartInit> {
        let start = Instant::now();
        let key = generate_storage_key(file_name);

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", &key, e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Backend("S3 returned no upload id".into()))?
            .to_string();

        let presigning = Self::presigning(self.part_url_ttl)?;
        let mut part_urls = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count {
            let presigned = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .presigned(presigning.clone())
                .await;
            match presigned {
                Ok(request) => part_urls.push(request.uri().to_string()),
                Err(err) => {
                    let _ = self.abort_multipart_upload(&key, &upload_id).await;
                    return Err(StorageError::Backend(format!(
                        "presigning part {}: {}",
                        part_number,
                        DisplayErrorContext(&err)
                    )));
                }
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            upload_id = %upload_id,
            size_bytes = file_size,
            part_count,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload created"
        );

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
        let start = Instant::now();
        let parts = normalize_parts(parts)?;
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.etag.clone())
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.code()).unwrap_or_default();
                match code {
                    "InvalidPart" | "InvalidPartOrder" | "NoSuchUpload" | "EntityTooSmall" => {
                        StorageError::Integrity(format!("{}: {}", code, DisplayErrorContext(&e)))
                    }
                    _ => map_sdk_error("complete_multipart_upload", key, e),
                }
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            parts = parts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload completed"
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;

        match result {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, key = %key, "S3 multipart upload aborted");
                Ok(())
            }
            Err(e) if e.as_service_error().and_then(|s| s.code()) == Some("NoSuchUpload") => {
                tracing::debug!(key = %key, "multipart upload already gone");
                Ok(())
            }
            Err(e) => Err(map_sdk_error("abort_multipart_upload", key, e)),
        }
    }

    async fn download_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        let start = Instant::now();

        let versions = match self.list_versions(key).await {
            Ok(versions) => versions,
            Err(StorageError::Backend(msg)) if msg.contains("NotImplemented") => {
                tracing::warn!(key = %key, "backend lacks ListObjectVersions, deleting current version only");
                return self.delete_current_version(key).await;
            }
            Err(err) => return Err(err),
        };

        if versions.is_empty() {
            tracing::debug!(bucket = %self.bucket, key = %key, "S3 object already absent");
            return Ok(());
        }

        for batch in versions.chunks(DELETE_BATCH) {
            let identifiers = batch
                .iter()
                .map(|(k, version)| {
                    ObjectIdentifier::builder()
                        .key(k)
                        .set_version_id(version.clone())
                        .build()
                        .map_err(|e| StorageError::Backend(e.to_string()))
                })
                .collect::<StorageResult<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_objects", key, e))?;

            if let Some(first) = output.errors().first() {
                tracing::error!(
                    bucket = %self.bucket,
                    key = %key,
                    code = ?first.code(),
                    message = ?first.message(),
                    failed = output.errors().len(),
                    "S3 version delete partially failed"
                );
                return Err(StorageError::Unavailable(format!(
                    "{} version(s) of `{}` not deleted: {}",
                    output.errors().len(),
                    key,
                    first.message().unwrap_or("unknown error")
                )));
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            versions = versions.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 object deleted (all versions)"
        );
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Fold an SDK error into the gateway taxonomy: timeouts, dispatch failures
/// and throttling are transient, everything else is a backend error.
fn map_sdk_error<E>(operation: &str, key: &str, err: SdkError<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));
    tracing::error!(operation, key = %key, error = %message, "S3 request failed");

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(message)
        }
        SdkError::ServiceError(service) => match service.err().code() {
            Some(
                "SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout"
                | "Throttling" | "ThrottlingException",
            ) => StorageError::Unavailable(message),
            Some("NoSuchKey" | "NotFound") => StorageError::NotFound(key.to_string()),
            _ => StorageError::Backend(message),
        },
        _ => StorageError::Backend(message),
    }
}
