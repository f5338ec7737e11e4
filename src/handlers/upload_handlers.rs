//! HTTP handlers for the multipart upload flow.
//!
//! Clients normally PUT parts straight to the presigned URLs; `/upload/parts`
//! relays a part for browsers that cannot, streaming the form's `file` field
//! into the upstream request.

use axum::{
    Json,
    extract::{Multipart, State, multipart::Field},
};
use bytes::Bytes;
use futures::{SinkExt, channel::mpsc, stream};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::io;

use crate::{
    auth::Owner,
    errors::AppError,
    models::upload::PartEtag,
    services::{
        relay_service::{PartStream, RelayError},
        upload_service::CreatedUpload,
    },
    state::AppState,
};

/// Chunks buffered between the form reader and the upstream request.
const RELAY_CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadReq {
    pub file_name: String,
    pub file_size: i64,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadReq {
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<PartEtag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadReq {
    pub upload_id: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct PartUploaded {
    pub etag: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub key: String,
}

/// `POST /upload/create`
pub async fn create_upload(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<CreateUploadReq>,
) -> Result<Json<CreatedUpload>, AppError> {
    let created = state
        .uploads
        .create_upload(
            &owner,
            &req.file_name,
            req.file_size,
            req.content_type.as_deref(),
        )
        .await?;
    Ok(Json(created))
}

/// `POST /upload/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<CompleteUploadReq>,
) -> Result<Json<UploadResult>, AppError> {
    let session = state
        .uploads
        .complete_upload(&owner, &req.upload_id, &req.key, &req.parts)
        .await?;
    Ok(Json(UploadResult {
        success: true,
        key: session.storage_key,
    }))
}

/// `POST /upload/abort`
pub async fn abort_upload(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<AbortUploadReq>,
) -> Result<Json<UploadResult>, AppError> {
    state
        .uploads
        .abort_upload(&owner, &req.upload_id, &req.key)
        .await?;
    Ok(Json(UploadResult {
        success: true,
        key: req.key,
    }))
}

/// Text fields of the relay form, collected as they arrive.
#[derive(Default)]
struct PartForm {
    part_url: Option<String>,
    part_number: Option<u32>,
    upload_id: Option<String>,
    key: Option<String>,
}

impl PartForm {
    fn is_ready(&self) -> bool {
        self.part_url.is_some()
            && self.part_number.is_some()
            && self.upload_id.is_some()
            && self.key.is_some()
    }

    /// Validated target URL, part number and expected part length.
    async fn target(&self, state: &AppState, owner: &Owner) -> Result<(Url, u32, u64), AppError> {
        let (Some(part_url), Some(part_number), Some(upload_id), Some(key)) = (
            self.part_url.as_deref(),
            self.part_number,
            self.upload_id.as_deref(),
            self.key.as_deref(),
        ) else {
            return Err(AppError::bad_request(
                "partUrl, partNumber, uploadId and key are required",
            ));
        };

        let length = state
            .uploads
            .part_length(owner, upload_id, key, part_number)
            .await?;
        let url = state.relay.validate(part_url, part_number, upload_id)?;
        Ok((url, part_number, length))
    }
}

fn bad_multipart(err: impl std::fmt::Display) -> AppError {
    AppError::bad_request(format!("invalid multipart body: {}", err))
}

async fn text_field(field: Field<'_>) -> Result<String, AppError> {
    field.text().await.map_err(bad_multipart)
}

/// `POST /upload/parts`
pub async fn upload_part(
    State(state): State<AppState>,
    owner: Owner,
    mut multipart: Multipart,
) -> Result<Json<PartUploaded>, AppError> {
    let mut form = PartForm::default();
    let mut buffered: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "partUrl" => form.part_url = Some(text_field(field).await?),
            "uploadId" => form.upload_id = Some(text_field(field).await?),
            "key" => form.key = Some(text_field(field).await?),
            "partNumber" => {
                let raw = text_field(field).await?;
                let number = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| AppError::bad_request("partNumber must be a positive integer"))?;
                form.part_number = Some(number);
            }
            "file" if form.is_ready() => {
                let (url, part_number, length) = form.target(&state, &owner).await?;
                let etag = relay_field(&state, field, &url, part_number, length).await?;
                return Ok(Json(PartUploaded { etag }));
            }
            "file" => {
                // Metadata comes after the bytes; hold this one part.
                buffered = Some(field.bytes().await.map_err(bad_multipart)?);
            }
            _ => {}
        }
    }

    let bytes = buffered.ok_or_else(|| AppError::bad_request("missing file field"))?;
    let (url, part_number, length) = form.target(&state, &owner).await?;
    if bytes.len() as u64 != length {
        return Err(AppError::bad_request(format!(
            "part {} must be {} bytes, got {}",
            part_number,
            length,
            bytes.len()
        )));
    }

    let body: PartStream = Box::pin(stream::once(async move { Ok::<_, io::Error>(bytes) }));
    let etag = state
        .relay
        .relay_part(&url, part_number, Some(length), body)
        .await?;
    Ok(Json(PartUploaded { etag }))
}

/// Pump the multipart field into the relay through a bounded channel so
/// the part is never held in memory as a whole.
///
/// The pump counts bytes; a part that runs past or stops short of `length`
/// aborts the upstream body and is rejected as a client error.
async fn relay_field(
    state: &AppState,
    mut field: Field<'_>,
    url: &Url,
    part_number: u32,
    length: u64,
) -> Result<String, AppError> {
    let (mut tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_CHANNEL_DEPTH);

    let pump = async move {
        let mut received = 0u64;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    received += chunk.len() as u64;
                    if received > length {
                        let _ = tx.send(Err(io::Error::other("part is too long"))).await;
                        return Err(received);
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) if received < length => {
                    let _ = tx.send(Err(io::Error::other("part is too short"))).await;
                    return Err(received);
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                    return Ok(());
                }
            }
        }
    };

    let body: PartStream = Box::pin(rx);
    let (pumped, result) = futures::join!(
        pump,
        state.relay.relay_part(url, part_number, Some(length), body)
    );
    if let Err(received) = pumped {
        tracing::warn!(part_number, expected = length, received, "part length mismatch");
        return Err(RelayError::Rejected(format!(
            "part {} must be {} bytes, got {}{}",
            part_number,
            length,
            received,
            if received > length { " or more" } else { "" }
        ))
        .into());
    }
    Ok(result?)
}
