//! Upload session manager.
//!
//! Plans how a file is split into parts, opens the multipart session at the
//! storage gateway and records who opened it, so a later transfer can only
//! attach keys its owner actually uploaded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{ops::Range, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    auth::Owner,
    config::AppConfig,
    errors::{ServiceError, ServiceResult},
    models::upload::{PartEtag, UploadSession, UploadStatus},
    services::storage::{ObjectStorage, keys::ensure_key_safe, normalize_parts},
};

pub const MIB: u64 = 1024 * 1024;
/// S3 refuses multipart uploads with more parts than this.
pub const MAX_PARTS: u64 = 10_000;
const MAX_FILE_NAME_LEN: usize = 1024;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How a file is sliced: every part is `part_size` bytes except the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub part_count: u32,
}

/// `part_count = ceil(file_size / part_size)`, never less than one.
pub fn plan_parts(file_size: u64, part_size: u64) -> ServiceResult<PartPlan> {
    if file_size == 0 {
        return Err(ServiceError::Validation("fileSize must be positive".into()));
    }
    if part_size == 0 {
        return Err(ServiceError::Validation("partSize must be positive".into()));
    }
    let count = file_size.div_ceil(part_size);
    let part_count = u32::try_from(count)
        .map_err(|_| ServiceError::Validation("file needs too many parts".into()))?;
    Ok(PartPlan {
        file_size,
        part_size,
        part_count,
    })
}

impl PartPlan {
    /// Plan with the preferred part size, growing it in whole MiB steps when
    /// the file would otherwise need more than [`MAX_PARTS`] parts.
    pub fn for_file(file_size: u64, preferred_part_size: u64) -> ServiceResult<Self> {
        let mut plan = plan_parts(file_size, preferred_part_size)?;
        if u64::from(plan.part_count) > MAX_PARTS {
            let min_part = file_size.div_ceil(MAX_PARTS);
            let part_size = min_part.div_ceil(MIB) * MIB;
            plan = plan_parts(file_size, part_size)?;
        }
        Ok(plan)
    }

    /// Byte range of a 1-based part number.
    pub fn part_range(&self, part_number: u32) -> Option<Range<u64>> {
        if part_number == 0 || part_number > self.part_count {
            return None;
        }
        let start = u64::from(part_number - 1) * self.part_size;
        let end = (start + self.part_size).min(self.file_size);
        Some(start..end)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (1..=self.part_count).filter_map(|n| self.part_range(n))
    }
}

/// Response of `createUpload`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUpload {
    pub upload_id: String,
    pub key: String,
    pub part_urls: Vec<String>,
    pub part_size: u64,
    pub part_count: u32,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub reaped: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct UploadService {
    db: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    config: Arc<AppConfig>,
}

const SESSION_COLUMNS: &str = "id, upload_id, storage_key, owner_id, file_name, file_size, \
     content_type, part_size, part_count, status, transfer_id, created_at, completed_at";

impl UploadService {
    pub fn new(db: SqlitePool, storage: Arc<dyn ObjectStorage>, config: Arc<AppConfig>) -> Self {
        Self {
            db,
            storage,
            config,
        }
    }

    /// Plan the parts, open the multipart session and record it for `owner`.
    #[tracing::instrument(skip(self, owner), fields(owner_id = %owner.id))]
    pub async fn create_upload(
        &self,
        owner: &Owner,
        file_name: &str,
        file_size: i64,
        content_type: Option<&str>,
    ) -> ServiceResult<CreatedUpload> {
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.len() > MAX_FILE_NAME_LEN {
            return Err(ServiceError::Validation(
                "fileName must be between 1 and 1024 bytes".into(),
            ));
        }
        if file_size <= 0 {
            return Err(ServiceError::Validation("fileSize must be positive".into()));
        }
        let content_type = match content_type.map(str::trim) {
            None | Some("") => DEFAULT_CONTENT_TYPE,
            Some(ct) if ct.len() <= 255 && ct.contains('/') => ct,
            Some(_) => return Err(ServiceError::Validation("invalid contentType".into())),
        };

        let limits = self
            .config
            .plan_limits(owner.plan)
            .ok_or_else(|| ServiceError::Validation(format!("unsupported plan `{}`", owner.plan)))?;
        let file_size = file_size as u64;
        if file_size > limits.max_transfer_bytes {
            return Err(ServiceError::QuotaExceeded(format!(
                "file exceeds the {} plan limit of {} bytes",
                owner.plan, limits.max_transfer_bytes
            )));
        }

        let plan = PartPlan::for_file(file_size, self.config.uploads.part_size)?;
        let init = self
            .storage
            .init_multipart_upload(file_name, file_size, content_type, plan.part_count)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO upload_sessions (
                id, upload_id, storage_key, owner_id, file_name, file_size, content_type,
                part_size, part_count, status, transfer_id, created_at, completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL)",
        )
        .bind(Uuid::new_v4())
        .bind(&init.upload_id)
        .bind(&init.key)
        .bind(owner.id)
        .bind(file_name)
        .bind(file_size as i64)
        .bind(content_type)
        .bind(plan.part_size as i64)
        .bind(i64::from(plan.part_count))
        .bind(UploadStatus::Pending)
        .bind(Utc::now())
        .execute(&self.db)
        .await;

        if let Err(err) = inserted {
            let _ = self
                .storage
                .abort_multipart_upload(&init.key, &init.upload_id)
                .await;
            return Err(err.into());
        }

        tracing::info!(
            key = %init.key,
            upload_id = %init.upload_id,
            size_bytes = file_size,
            part_size = plan.part_size,
            part_count = plan.part_count,
            "upload session created"
        );

        Ok(CreatedUpload {
            upload_id: init.upload_id,
            key: init.key,
            part_urls: init.part_urls,
            part_size: plan.part_size,
            part_count: plan.part_count,
        })
    }

    /// Finish the upload once every planned part is present.
    ///
    /// Repeating a successful completion is a no-op so clients can retry
    /// after losing the response.
    #[tracing::instrument(skip(self, owner, parts), fields(owner_id = %owner.id, parts = parts.len()))]
    pub async fn complete_upload(
        &self,
        owner: &Owner,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> ServiceResult<UploadSession> {
        let session = self.owned_session(owner, upload_id, key).await?;
        match session.status {
            UploadStatus::Pending => {}
            UploadStatus::Completed => return Ok(session),
            _ => {
                return Err(ServiceError::Validation(
                    "upload is no longer open".into(),
                ));
            }
        }

        let sorted = normalize_parts(parts).map_err(ServiceError::from)?;
        if sorted.len() as i64 != session.part_count {
            return Err(ServiceError::Integrity(format!(
                "expected {} parts, got {}",
                session.part_count,
                sorted.len()
            )));
        }

        self.storage
            .complete_multipart_upload(key, upload_id, &sorted)
            .await?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE upload_sessions SET status = ?, completed_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(now)
        .bind(session.id)
        .bind(UploadStatus::Pending)
        .execute(&self.db)
        .await?;

        tracing::info!(key = %key, "upload completed");
        Ok(UploadSession {
            status: UploadStatus::Completed,
            completed_at: Some(now),
            ..session
        })
    }

    /// Abandon an open upload. Aborting an aborted upload is not an error.
    #[tracing::instrument(skip(self, owner), fields(owner_id = %owner.id))]
    pub async fn abort_upload(&self, owner: &Owner, upload_id: &str, key: &str) -> ServiceResult<()> {
        let session = self.owned_session(owner, upload_id, key).await?;
        match session.status {
            UploadStatus::Pending => {}
            UploadStatus::Aborted | UploadStatus::Reaped => return Ok(()),
            UploadStatus::Completed | UploadStatus::Consumed => {
                return Err(ServiceError::Validation(
                    "completed uploads cannot be aborted".into(),
                ));
            }
        }

        self.storage.abort_multipart_upload(key, upload_id).await?;
        sqlx::query("UPDATE upload_sessions SET status = ? WHERE id = ? AND status = ?")
            .bind(UploadStatus::Aborted)
            .bind(session.id)
            .bind(UploadStatus::Pending)
            .execute(&self.db)
            .await?;

        tracing::info!(key = %key, "upload aborted");
        Ok(())
    }

    /// Expected byte length of one part of an open upload owned by `owner`.
    pub async fn part_length(
        &self,
        owner: &Owner,
        upload_id: &str,
        key: &str,
        part_number: u32,
    ) -> ServiceResult<u64> {
        let session = self.owned_session(owner, upload_id, key).await?;
        if session.status != UploadStatus::Pending {
            return Err(ServiceError::Validation("upload is no longer open".into()));
        }
        let plan = plan_parts(session.file_size as u64, session.part_size as u64)?;
        plan.part_range(part_number)
            .map(|r| r.end - r.start)
            .ok_or_else(|| {
                ServiceError::Validation(format!(
                    "partNumber must be between 1 and {}",
                    plan.part_count
                ))
            })
    }

    pub async fn find_session(&self, key: &str) -> ServiceResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE storage_key = ?",
            SESSION_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(session)
    }

    async fn owned_session(
        &self,
        owner: &Owner,
        upload_id: &str,
        key: &str,
    ) -> ServiceResult<UploadSession> {
        ensure_key_safe(key)?;
        let session = self
            .find_session(key)
            .await?
            .ok_or_else(|| ServiceError::NotFound("upload not found".into()))?;
        if session.owner_id != owner.id {
            tracing::warn!(key = %key, owner_id = %owner.id, "upload accessed by non-owner");
            return Err(ServiceError::Forbidden("upload belongs to another user".into()));
        }
        if session.upload_id != upload_id {
            return Err(ServiceError::Validation(
                "uploadId does not match key".into(),
            ));
        }
        Ok(session)
    }

    /// Remove uploads nobody attached to a transfer within the grace window:
    /// pending sessions are aborted, completed ones have their object
    /// deleted. Each session is claimed before touching storage so a
    /// concurrent transfer creation can never attach a reaped key.
    pub async fn reap_orphans(&self, grace: Duration, limit: u32) -> ServiceResult<OrphanReport> {
        self.reap_orphans_at(Utc::now(), grace, limit).await
    }

    pub async fn reap_orphans_at(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: u32,
    ) -> ServiceResult<OrphanReport> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let cutoff = now - grace;

        // Sessions that failed before go to the back of the queue.
        let candidates = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions
             WHERE status IN (?, ?) AND COALESCE(completed_at, created_at) < ?
             ORDER BY reap_attempted_at ASC, created_at ASC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(UploadStatus::Pending)
        .bind(UploadStatus::Completed)
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;

        let mut report = OrphanReport::default();
        for session in candidates {
            let claimed = sqlx::query(
                "UPDATE upload_sessions SET status = ? WHERE id = ? AND status = ?",
            )
            .bind(UploadStatus::Reaped)
            .bind(session.id)
            .bind(session.status)
            .execute(&self.db)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            let result = match session.status {
                UploadStatus::Pending => {
                    self.storage
                        .abort_multipart_upload(&session.storage_key, &session.upload_id)
                        .await
                }
                _ => self.storage.delete_file(&session.storage_key).await,
            };

            match result {
                Ok(()) => {
                    report.reaped += 1;
                    tracing::info!(key = %session.storage_key, "orphaned upload reaped");
                }
                Err(err) => {
                    tracing::warn!(key = %session.storage_key, error = %err, "failed to reap orphaned upload");
                    report
                        .errors
                        .push(format!("{}: {}", session.storage_key, err));
                    sqlx::query(
                        "UPDATE upload_sessions SET status = ?, reap_attempted_at = ?
                         WHERE id = ? AND status = ?",
                    )
                    .bind(session.status)
                    .bind(now)
                    .bind(session.id)
                    .bind(UploadStatus::Reaped)
                    .execute(&self.db)
                    .await?;
                }
            }
        }

        Ok(report)
    }

    pub async fn count_orphans(&self, grace: Duration) -> ServiceResult<i64> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_sessions
             WHERE status IN (?, ?) AND COALESCE(completed_at, created_at) < ?",
        )
        .bind(UploadStatus::Pending)
        .bind(UploadStatus::Completed)
        .bind(Utc::now() - grace)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}
