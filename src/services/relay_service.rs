//! Upload part relay.
//!
//! Forwards one part's bytes to its presigned URL for callers that cannot
//! reach the object store directly, and hands back the storage ETag. Bytes
//! are streamed through; the upstream status is surfaced verbatim on failure.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::{Url, header};
use std::{collections::HashMap, io, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;

pub type PartStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Storage answered with a non-success status.
    #[error("storage responded {status}: {body}")]
    Upstream { status: u16, body: String },
    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),
    /// The request was refused before contacting storage.
    #[error("{0}")]
    Rejected(String),
}

impl RelayError {
    /// S3 answers an expired presigned URL with 403 and "Request has expired".
    pub fn is_expired_response(status: u16, body: &str) -> bool {
        status == 403 && body.contains("Request has expired")
    }
}

/// Something that can PUT a part body to a presigned part URL.
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// Whether `url` points at the storage this transport serves.
    fn accepts(&self, url: &Url) -> bool;

    async fn put_part(
        &self,
        url: &Url,
        content_length: Option<u64>,
        body: PartStream,
    ) -> Result<String, RelayError>;
}

/// Streams parts to S3 over HTTP.
pub struct HttpPartTransport {
    client: reqwest::Client,
    bucket: String,
    endpoint_host: Option<String>,
}

impl HttpPartTransport {
    pub fn new(bucket: String, endpoint: Option<&str>, timeout: Duration) -> Result<Self, RelayError> {
        let endpoint_host = match endpoint {
            Some(raw) => Some(
                Url::parse(raw)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .ok_or_else(|| RelayError::Rejected(format!("invalid storage endpoint `{}`", raw)))?,
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            bucket,
            endpoint_host,
        })
    }
}

#[async_trait]
impl PartTransport for HttpPartTransport {
    fn accepts(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "https" | "http") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        match &self.endpoint_host {
            Some(endpoint) => host == endpoint,
            None => {
                url.scheme() == "https"
                    && host.starts_with(&format!("{}.s3.", self.bucket))
                    && host.ends_with(".amazonaws.com")
            }
        }
    }

    async fn put_part(
        &self,
        url: &Url,
        content_length: Option<u64>,
        body: PartStream,
    ) -> Result<String, RelayError> {
        let mut request = self
            .client
            .put(url.clone())
            .body(reqwest::Body::wrap_stream(body));
        if let Some(len) = content_length {
            request = request.header(header::CONTENT_LENGTH, len);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Upstream {
                status: 502,
                body: "storage response carried no ETag".into(),
            })
    }
}

/// Validates relay requests and hands them to the configured transport.
#[derive(Clone)]
pub struct PartRelay {
    transport: Arc<dyn PartTransport>,
}

impl PartRelay {
    pub fn new(transport: Arc<dyn PartTransport>) -> Self {
        Self { transport }
    }

    /// Check that `part_url` targets our storage and names the upload and
    /// part the caller claims, so the relay cannot be pointed elsewhere.
    pub fn validate(
        &self,
        part_url: &str,
        part_number: u32,
        upload_id: &str,
    ) -> Result<Url, RelayError> {
        let url = Url::parse(part_url)
            .map_err(|_| RelayError::Rejected("partUrl is not a valid URL".into()))?;
        if !self.transport.accepts(&url) {
            return Err(RelayError::Rejected(
                "partUrl does not point at the configured storage".into(),
            ));
        }

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        if query.get("uploadId").map(String::as_str) != Some(upload_id) {
            return Err(RelayError::Rejected(
                "partUrl does not belong to this upload".into(),
            ));
        }
        if query.get("partNumber") != Some(&part_number.to_string()) {
            return Err(RelayError::Rejected(
                "partUrl does not match partNumber".into(),
            ));
        }
        Ok(url)
    }

    /// Forward one part and return the storage-assigned ETag.
    pub async fn relay_part(
        &self,
        url: &Url,
        part_number: u32,
        content_length: Option<u64>,
        body: PartStream,
    ) -> Result<String, RelayError> {
        let result = self.transport.put_part(url, content_length, body).await;
        match &result {
            Ok(etag) => tracing::debug!(part_number, etag = %etag, "part relayed"),
            Err(err) => tracing::warn!(part_number, error = %err, "part relay failed"),
        }
        result
    }
}
