//! Public, unauthenticated endpoints reached through a share link.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    errors::AppError,
    services::transfer_service::{DownloadLink, TransferMeta},
    state::AppState,
};

/// Alternative to `?password=` that keeps the secret out of access logs.
pub const PASSWORD_HEADER: &str = "x-transfer-password";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub file_id: Uuid,
    #[serde(default)]
    pub password: Option<String>,
}

/// `GET /share/{slug}`
pub async fn get_share(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<TransferMeta>, AppError> {
    let meta = state.transfers.get_transfer_meta(&slug).await?;
    Ok(Json(meta))
}

/// `GET /share/{slug}/download?fileId=...&password=...`
pub async fn download(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Query(q): Query<DownloadQuery>,
) -> Result<Json<DownloadLink>, AppError> {
    let password = q.password.or_else(|| {
        headers
            .get(PASSWORD_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let link = state
        .transfers
        .download_url(&slug, q.file_id, password.as_deref())
        .await?;
    Ok(Json(link))
}
