//! Transfer lifecycle manager.
//!
//! A transfer is created from completed uploads, read through its slug and
//! removed either by its owner or by the expiration sweep. The database is
//! the source of truth; storage deletes are recorded per file so a failed
//! delete is found again by the next sweep.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::{collections::HashSet, sync::Arc};
use uuid::Uuid;

use crate::{
    auth::Owner,
    config::AppConfig,
    db,
    errors::{ServiceError, ServiceResult},
    models::{
        file_object::{FileObject, FileSummary},
        transfer::{Transfer, TransferStatus},
        upload::UploadStatus,
    },
    services::storage::{ObjectStorage, StorageError},
};

const SLUG_BYTES: usize = 12;
const SLUG_ATTEMPTS: usize = 8;
const MAX_FILES_PER_TRANSFER: usize = 1000;
const MAX_PASSWORD_LEN: usize = 256;
const OWNER_LIST_LIMIT: i64 = 200;

pub(crate) const TRANSFER_COLUMNS: &str = "id, slug, owner_id, total_size_bytes, status, \
     created_at, expires_at, password_hash, branding_id, closed_at, cleanup_completed_at";
const FILE_COLUMNS: &str =
    "id, transfer_id, storage_key, file_name, size_bytes, content_type, created_at, deleted_at";

/// Produces candidate slugs. Swappable so collisions can be forced in tests.
pub type SlugGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// 12 random bytes, URL-safe base64 without padding (16 characters).
pub fn generate_slug() -> String {
    let mut bytes = [0u8; SLUG_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferFileInput {
    pub key: String,
    pub name: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransferInput {
    pub files: Vec<TransferFileInput>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub branding_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedTransfer {
    pub id: Uuid,
    pub slug: String,
    pub expires_at: DateTime<Utc>,
}

/// What a slug holder may see before presenting any password.
#[derive(Debug, Clone, Serialize)]
pub struct TransferMeta {
    pub slug: String,
    pub expires_at: DateTime<Utc>,
    pub requires_password: bool,
    pub files: Vec<FileSummary>,
    pub branding: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub download_url: String,
    pub expires_in_secs: u64,
}

/// Row of the owner's transfer list.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransferSummary {
    pub id: Uuid,
    pub slug: String,
    pub status: TransferStatus,
    pub total_size_bytes: i64,
    pub file_count: i64,
    pub requires_password: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of deleting the remaining objects of one transfer.
#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub deleted: u64,
    pub failed: Vec<(String, StorageError)>,
}

impl PurgeOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct TransferService {
    db: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    config: Arc<AppConfig>,
    slug_generator: SlugGenerator,
}

impl TransferService {
    pub fn new(db: SqlitePool, storage: Arc<dyn ObjectStorage>, config: Arc<AppConfig>) -> Self {
        Self {
            db,
            storage,
            config,
            slug_generator: Arc::new(generate_slug),
        }
    }

    pub fn with_slug_generator(mut self, generator: SlugGenerator) -> Self {
        self.slug_generator = generator;
        self
    }

    pub async fn create_transfer(
        &self,
        owner: &Owner,
        input: CreateTransferInput,
    ) -> ServiceResult<CreatedTransfer> {
        self.create_transfer_at(Utc::now(), owner, input).await
    }

    /// Bundle completed uploads into a transfer.
    ///
    /// Every key must come from a completed upload session of `owner`; the
    /// sessions are consumed in the same transaction that inserts the
    /// transfer, so a key can back at most one transfer.
    #[tracing::instrument(skip(self, owner, input), fields(owner_id = %owner.id, files = input.files.len()))]
    pub async fn create_transfer_at(
        &self,
        now: DateTime<Utc>,
        owner: &Owner,
        input: CreateTransferInput,
    ) -> ServiceResult<CreatedTransfer> {
        validate_files(&input.files)?;

        let limits = self
            .config
            .plan_limits(owner.plan)
            .ok_or_else(|| ServiceError::Validation(format!("unsupported plan `{}`", owner.plan)))?;

        let total_size = input
            .files
            .iter()
            .try_fold(0u64, |acc, f| acc.checked_add(f.size_bytes as u64))
            .ok_or_else(|| ServiceError::Validation("total size overflows".into()))?;
        if total_size > limits.max_transfer_bytes {
            return Err(ServiceError::QuotaExceeded(format!(
                "transfer of {} bytes exceeds the {} plan limit of {} bytes",
                total_size, owner.plan, limits.max_transfer_bytes
            )));
        }

        let expires_at = match input.expires_at {
            None => now + ChronoDuration::days(i64::from(limits.expiry_days)),
            Some(at) if at <= now => {
                return Err(ServiceError::Validation("expiresAt must be in the future".into()));
            }
            Some(at) if at > now + ChronoDuration::days(i64::from(limits.max_expiry_days)) => {
                return Err(ServiceError::Validation(format!(
                    "expiresAt exceeds the {} plan maximum of {} days",
                    owner.plan, limits.max_expiry_days
                )));
            }
            Some(at) => at,
        };

        let password_hash = match input.password.as_deref() {
            None | Some("") => None,
            Some(p) if p.len() > MAX_PASSWORD_LEN => {
                return Err(ServiceError::Validation("password is too long".into()));
            }
            Some(p) => Some(hash_password(p.to_string()).await?),
        };

        let transfer_id = Uuid::new_v4();
        let mut tx = db::begin_write(&self.db).await?;

        if let Some(monthly) = limits.monthly_transfers {
            let created: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM transfers WHERE owner_id = ? AND created_at >= ?",
            )
            .bind(owner.id)
            .bind(month_start(now))
            .fetch_one(&mut *tx)
            .await?;
            if created >= i64::from(monthly) {
                return Err(ServiceError::QuotaExceeded(format!(
                    "the {} plan allows {} transfers per month",
                    owner.plan, monthly
                )));
            }
        }

        let mut slug = None;
        for attempt in 1..=SLUG_ATTEMPTS {
            let candidate = (self.slug_generator)();
            let inserted = sqlx::query(
                "INSERT INTO transfers (
                    id, slug, owner_id, total_size_bytes, status, created_at, expires_at,
                    password_hash, branding_id, closed_at, cleanup_completed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
            )
            .bind(transfer_id)
            .bind(&candidate)
            .bind(owner.id)
            .bind(total_size as i64)
            .bind(TransferStatus::Active)
            .bind(now)
            .bind(expires_at)
            .bind(password_hash.as_deref())
            .bind(input.branding_id.as_deref())
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    slug = Some(candidate);
                    break;
                }
                Err(err) if db::is_unique_violation(&err) => {
                    tracing::warn!(attempt, "slug collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let slug = slug.ok_or_else(|| ServiceError::Internal("could not allocate a slug".into()))?;

        for file in &input.files {
            let session_type: Option<String> = sqlx::query_scalar(
                "UPDATE upload_sessions SET status = ?, transfer_id = ?
                 WHERE storage_key = ? AND owner_id = ? AND status = ? AND file_size = ?
                 RETURNING content_type",
            )
            .bind(UploadStatus::Consumed)
            .bind(transfer_id)
            .bind(&file.key)
            .bind(owner.id)
            .bind(UploadStatus::Completed)
            .bind(file.size_bytes)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(session_type) = session_type else {
                tracing::warn!(key = %file.key, "rejected key that is not an unused completed upload of the owner");
                return Err(ServiceError::Validation(format!(
                    "file `{}` is not a completed upload available to this account",
                    file.name
                )));
            };

            let content_type = file
                .content_type
                .as_deref()
                .map(str::trim)
                .filter(|ct| !ct.is_empty())
                .map(str::to_string)
                .unwrap_or(session_type);

            sqlx::query(
                "INSERT INTO file_objects (
                    id, transfer_id, storage_key, file_name, size_bytes, content_type,
                    created_at, deleted_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(Uuid::new_v4())
            .bind(transfer_id)
            .bind(&file.key)
            .bind(file.name.trim())
            .bind(file.size_bytes)
            .bind(content_type)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if db::is_unique_violation(&err) {
                    ServiceError::Validation(format!("file `{}` is already attached", file.name))
                } else {
                    err.into()
                }
            })?;
        }

        tx.commit().await?;

        tracing::info!(
            transfer_id = %transfer_id,
            slug = %slug,
            size_bytes = total_size,
            expires_at = %expires_at,
            protected = password_hash.is_some(),
            "transfer created"
        );

        Ok(CreatedTransfer {
            id: transfer_id,
            slug,
            expires_at,
        })
    }

    pub async fn find_transfer(&self, id: Uuid) -> ServiceResult<Option<Transfer>> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {} FROM transfers WHERE id = ?",
            TRANSFER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(transfer)
    }

    async fn readable_by_slug(&self, now: DateTime<Utc>, slug: &str) -> ServiceResult<Transfer> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {} FROM transfers WHERE slug = ?",
            TRANSFER_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.db)
        .await?;

        match transfer {
            Some(t) if t.is_readable_at(now) => Ok(t),
            _ => Err(ServiceError::not_found()),
        }
    }

    pub async fn get_transfer_meta(&self, slug: &str) -> ServiceResult<TransferMeta> {
        self.get_transfer_meta_at(Utc::now(), slug).await
    }

    /// Metadata only. Expiry is checked here and does not wait for the sweep.
    pub async fn get_transfer_meta_at(
        &self,
        now: DateTime<Utc>,
        slug: &str,
    ) -> ServiceResult<TransferMeta> {
        let transfer = self.readable_by_slug(now, slug).await?;
        let files = self.live_files(transfer.id).await?;

        Ok(TransferMeta {
            requires_password: transfer.requires_password(),
            slug: transfer.slug,
            expires_at: transfer.expires_at,
            files: files.iter().map(FileSummary::from).collect(),
            branding: transfer.branding_id,
        })
    }

    pub async fn download_url(
        &self,
        slug: &str,
        file_id: Uuid,
        password: Option<&str>,
    ) -> ServiceResult<DownloadLink> {
        self.download_url_at(Utc::now(), slug, file_id, password).await
    }

    /// Issue a short-lived URL for one file. This is the access checkpoint
    /// for protected transfers.
    #[tracing::instrument(skip(self, password))]
    pub async fn download_url_at(
        &self,
        now: DateTime<Utc>,
        slug: &str,
        file_id: Uuid,
        password: Option<&str>,
    ) -> ServiceResult<DownloadLink> {
        let transfer = self.readable_by_slug(now, slug).await?;

        if let Some(hash) = transfer.password_hash.clone() {
            let Some(password) = password.filter(|p| !p.is_empty()) else {
                return Err(ServiceError::Forbidden("password required".into()));
            };
            if !verify_password(password.to_string(), hash).await? {
                tracing::warn!(transfer_id = %transfer.id, "wrong transfer password");
                return Err(ServiceError::Forbidden("incorrect password".into()));
            }
        }

        let file = sqlx::query_as::<_, FileObject>(&format!(
            "SELECT {} FROM file_objects WHERE id = ? AND transfer_id = ? AND deleted_at IS NULL",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .bind(transfer.id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| ServiceError::NotFound("file not found".into()))?;

        let ttl = self.config.uploads.download_url_ttl;
        let url = self.storage.download_url(&file.storage_key, ttl).await?;

        tracing::info!(transfer_id = %transfer.id, file_id = %file.id, "download URL issued");
        Ok(DownloadLink {
            download_url: url,
            expires_in_secs: ttl.as_secs(),
        })
    }

    /// Transfers created by `owner`, newest first.
    pub async fn list_transfers(&self, owner: &Owner) -> ServiceResult<Vec<TransferSummary>> {
        let rows = sqlx::query_as::<_, TransferSummary>(
            "SELECT t.id, t.slug, t.status, t.total_size_bytes,
                    (SELECT COUNT(*) FROM file_objects f WHERE f.transfer_id = t.id) AS file_count,
                    t.password_hash IS NOT NULL AS requires_password,
                    t.created_at, t.expires_at
             FROM transfers t
             WHERE t.owner_id = ?
             ORDER BY t.created_at DESC
             LIMIT ?",
        )
        .bind(owner.id)
        .bind(OWNER_LIST_LIMIT)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn delete_transfer(&self, owner: &Owner, id: Uuid) -> ServiceResult<()> {
        self.delete_transfer_at(Utc::now(), owner, id).await
    }

    /// Owner deletion. The row moves to `deleting` first and only reaches
    /// `deleted` once every backing object is gone; failures leave it
    /// `deleting` for the sweep to finish.
    #[tracing::instrument(skip(self, owner), fields(owner_id = %owner.id))]
    pub async fn delete_transfer_at(
        &self,
        now: DateTime<Utc>,
        owner: &Owner,
        id: Uuid,
    ) -> ServiceResult<()> {
        let transfer = self.find_transfer(id).await?.ok_or_else(ServiceError::not_found)?;
        if transfer.owner_id != owner.id {
            tracing::warn!(transfer_id = %id, "delete attempted by non-owner");
            return Err(ServiceError::Forbidden("transfer belongs to another user".into()));
        }
        if !matches!(
            transfer.status,
            TransferStatus::Active | TransferStatus::Deleting
        ) {
            return Err(ServiceError::not_found());
        }

        // Only a live or half-deleted transfer may move to `deleting`. A
        // transfer past its expiry belongs to the sweep, even if the sweep
        // has not marked it yet.
        let claimed = sqlx::query(
            "UPDATE transfers SET status = ?, closed_at = COALESCE(closed_at, ?)
             WHERE id = ? AND (status = ? OR (status = ? AND expires_at > ?))",
        )
        .bind(TransferStatus::Deleting)
        .bind(now)
        .bind(id)
        .bind(TransferStatus::Deleting)
        .bind(TransferStatus::Active)
        .bind(now)
        .execute(&self.db)
        .await?;
        if claimed.rows_affected() == 0 {
            tracing::info!(transfer_id = %id, "transfer left the active state before deletion");
            return Err(ServiceError::not_found());
        }

        let outcome = self.purge_files(id, now).await?;
        if !outcome.is_complete() {
            for (key, err) in &outcome.failed {
                tracing::warn!(transfer_id = %id, key = %key, error = %err, "object delete failed");
            }
            return Err(ServiceError::StorageTransient(format!(
                "{} file(s) could not be deleted yet; cleanup will be retried",
                outcome.failed.len()
            )));
        }

        self.finalize_cleanup(id, now).await?;
        tracing::info!(transfer_id = %id, objects = outcome.deleted, "transfer deleted");
        Ok(())
    }

    /// Delete every object of `transfer_id` not yet confirmed gone and stamp
    /// the ones that succeed. Safe to repeat; missing objects count as
    /// deleted.
    pub async fn purge_files(
        &self,
        transfer_id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<PurgeOutcome> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT storage_key FROM file_objects WHERE transfer_id = ? AND deleted_at IS NULL",
        )
        .bind(transfer_id)
        .fetch_all(&self.db)
        .await?;
        if keys.is_empty() {
            return Ok(PurgeOutcome::default());
        }

        sqlx::query("UPDATE transfers SET cleanup_attempted_at = ? WHERE id = ?")
            .bind(now)
            .bind(transfer_id)
            .execute(&self.db)
            .await?;

        let report = self.storage.delete_files(&keys).await;
        let mut outcome = PurgeOutcome {
            deleted: 0,
            failed: report.failed,
        };
        for key in &report.deleted {
            sqlx::query(
                "UPDATE file_objects SET deleted_at = ? WHERE storage_key = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(key)
            .execute(&self.db)
            .await?;
            outcome.deleted += 1;
        }
        Ok(outcome)
    }

    /// Close out a non-active transfer once no object remains: stamp
    /// `cleanup_completed_at` and move `deleting` to `deleted`.
    pub async fn finalize_cleanup(&self, transfer_id: Uuid, now: DateTime<Utc>) -> ServiceResult<bool> {
        let result = sqlx::query(
            "UPDATE transfers
             SET cleanup_completed_at = COALESCE(cleanup_completed_at, ?),
                 status = CASE WHEN status = ? THEN ? ELSE status END
             WHERE id = ? AND status != ?
               AND NOT EXISTS (
                   SELECT 1 FROM file_objects f
                   WHERE f.transfer_id = transfers.id AND f.deleted_at IS NULL
               )",
        )
        .bind(now)
        .bind(TransferStatus::Deleting)
        .bind(TransferStatus::Deleted)
        .bind(transfer_id)
        .bind(TransferStatus::Active)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn live_files(&self, transfer_id: Uuid) -> ServiceResult<Vec<FileObject>> {
        let files = sqlx::query_as::<_, FileObject>(&format!(
            "SELECT {} FROM file_objects
             WHERE transfer_id = ? AND deleted_at IS NULL
             ORDER BY file_name ASC",
            FILE_COLUMNS
        ))
        .bind(transfer_id)
        .fetch_all(&self.db)
        .await?;
        Ok(files)
    }
}

fn validate_files(files: &[TransferFileInput]) -> ServiceResult<()> {
    if files.is_empty() {
        return Err(ServiceError::Validation("a transfer needs at least one file".into()));
    }
    if files.len() > MAX_FILES_PER_TRANSFER {
        return Err(ServiceError::Validation(format!(
            "a transfer holds at most {} files",
            MAX_FILES_PER_TRANSFER
        )));
    }

    let mut keys = HashSet::with_capacity(files.len());
    for file in files {
        if file.key.trim().is_empty() {
            return Err(ServiceError::Validation("file key is required".into()));
        }
        let name = file.name.trim();
        if name.is_empty() || name.len() > 1024 {
            return Err(ServiceError::Validation(
                "file name must be between 1 and 1024 bytes".into(),
            ));
        }
        if file.size_bytes <= 0 {
            return Err(ServiceError::Validation(format!(
                "file `{}` has no content",
                name
            )));
        }
        if !keys.insert(file.key.as_str()) {
            return Err(ServiceError::Validation(format!(
                "file `{}` is listed twice",
                name
            )));
        }
    }
    Ok(())
}

/// First instant of `now`'s UTC calendar month.
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    date.with_day(1).unwrap_or(date).and_time(NaiveTime::MIN).and_utc()
}

/// Argon2id PHC string, computed off the async workers.
async fn hash_password(password: String) -> ServiceResult<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServiceError::Internal(format!("hashing password: {}", e)))
    })
    .await
    .map_err(|e| ServiceError::Internal(e.to_string()))?
}

async fn verify_password(password: String, hash: String) -> ServiceResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| ServiceError::Internal(format!("stored password hash: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| ServiceError::Internal(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::plan::Plan,
        services::{storage::MockStorage, test_support::seed_completed_upload},
    };
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct Harness {
        db: SqlitePool,
        storage: Arc<MockStorage>,
        service: TransferService,
        owner: Owner,
    }

    async fn harness() -> Harness {
        let db = crate::db::test_pool().await.unwrap();
        let storage = Arc::new(MockStorage::new("test-bucket", std::time::Duration::from_secs(60)));
        let service = TransferService::new(
            db.clone(),
            storage.clone(),
            Arc::new(AppConfig::for_tests()),
        );
        Harness {
            db,
            storage,
            service,
            owner: Owner::new(Uuid::new_v4(), Plan::Free),
        }
    }

    impl Harness {
        async fn upload(&self, name: &str, size: i64) -> TransferFileInput {
            let key = seed_completed_upload(&self.db, &self.storage, &self.owner, name, size).await;
            TransferFileInput {
                key,
                name: name.into(),
                size_bytes: size,
                content_type: None,
            }
        }

        async fn transfer_with(&self, files: Vec<TransferFileInput>) -> CreatedTransfer {
            self.service
                .create_transfer(
                    &self.owner,
                    CreateTransferInput {
                        files,
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }
    }

    #[test]
    fn slugs_are_url_safe_and_distinct() {
        let slugs: HashSet<String> = (0..10_000).map(|_| generate_slug()).collect();
        assert_eq!(slugs.len(), 10_000);
        for slug in slugs.iter().take(20) {
            assert_eq!(slug.len(), 16);
            assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn month_start_is_first_midnight() {
        let now = "2026-03-17T15:04:05Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(month_start(now).to_rfc3339(), "2026-03-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn create_uses_plan_default_expiry() {
        let h = harness().await;
        let file = h.upload("report.pdf", 1024).await;
        let now = Utc::now();
        let created = h
            .service
            .create_transfer_at(
                now,
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.expires_at, now + ChronoDuration::days(7));

        let meta = h.service.get_transfer_meta(&created.slug).await.unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].name, "report.pdf");
        assert_eq!(meta.files[0].content_type, "application/octet-stream");
        assert!(!meta.requires_password);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let h = harness().await;
        let err = h
            .service
            .create_transfer(&h.owner, CreateTransferInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let mut file = h.upload("a.txt", 10).await;
        file.size_bytes = 0;
        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn expiry_beyond_plan_cap_is_rejected() {
        let h = harness().await;
        let file = h.upload("a.txt", 10).await;
        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    expires_at: Some(Utc::now() + ChronoDuration::days(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(msg) if msg.contains("maximum")));
    }

    #[tokio::test]
    async fn oversize_transfer_hits_quota() {
        let h = harness().await;
        let a = h.upload("a.bin", 1500 * 1024 * 1024).await;
        let b = h.upload("b.bin", 1500 * 1024 * 1024).await;
        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![a, b],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn monthly_quota_is_enforced() {
        let h = harness().await;
        for i in 0..10 {
            let file = h.upload(&format!("f{}.txt", i), 10).await;
            h.transfer_with(vec![file]).await;
        }
        let file = h.upload("one-too-many.txt", 10).await;
        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn keys_are_consumed_exactly_once() {
        let h = harness().await;
        let file = h.upload("shared.txt", 10).await;
        h.transfer_with(vec![file.clone()]).await;

        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn keys_of_other_users_are_rejected() {
        let h = harness().await;
        let file = h.upload("mine.txt", 10).await;
        let thief = Owner::new(Uuid::new_v4(), Plan::Free);
        let err = h
            .service
            .create_transfer(
                &thief,
                CreateTransferInput {
                    files: vec![file.clone()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // The failed attempt rolled back; the owner can still use the key.
        h.transfer_with(vec![file]).await;
    }

    #[tokio::test]
    async fn size_mismatch_with_session_is_rejected() {
        let h = harness().await;
        let mut file = h.upload("a.txt", 10).await;
        file.size_bytes = 5;
        let err = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn slug_collisions_are_retried() {
        let h = harness().await;
        let first = h.upload("a.txt", 10).await;
        let created = h.transfer_with(vec![first]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let taken = created.slug.clone();
        let counter = calls.clone();
        let service = h.service.clone().with_slug_generator(Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                taken.clone()
            } else {
                generate_slug()
            }
        }));

        let second = h.upload("b.txt", 10).await;
        let again = service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![second],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(again.slug, created.slug);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_slug_attempts_are_an_internal_error() {
        let h = harness().await;
        let first = h.upload("a.txt", 10).await;
        let created = h.transfer_with(vec![first]).await;
        let taken = created.slug.clone();
        let service = h
            .service
            .clone()
            .with_slug_generator(Arc::new(move || taken.clone()));

        let second = h.upload("b.txt", 10).await;
        let err = service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![second.clone()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));

        // Nothing was consumed by the failed attempt.
        h.transfer_with(vec![second]).await;
    }

    #[tokio::test]
    async fn password_gate() {
        let h = harness().await;
        let file = h.upload("secret.txt", 10).await;
        let created = h
            .service
            .create_transfer(
                &h.owner,
                CreateTransferInput {
                    files: vec![file],
                    password: Some("secret".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let meta = h.service.get_transfer_meta(&created.slug).await.unwrap();
        assert!(meta.requires_password);
        let file_id = meta.files[0].id;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM transfers WHERE id = ?")
                .bind(created.id)
                .fetch_one(&h.db)
                .await
                .unwrap();
        assert!(stored.unwrap().starts_with("$argon2"));

        for attempt in [None, Some("wrong")] {
            let err = h
                .service
                .download_url(&created.slug, file_id, attempt)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Forbidden(_)));
        }
        let link = h
            .service
            .download_url(&created.slug, file_id, Some("secret"))
            .await
            .unwrap();
        assert!(!link.download_url.is_empty());
    }

    #[tokio::test]
    async fn open_transfer_needs_no_password_and_urls_differ() {
        let h = harness().await;
        let file = h.upload("open.txt", 10).await;
        let created = h.transfer_with(vec![file]).await;
        let meta = h.service.get_transfer_meta(&created.slug).await.unwrap();

        let a = h.service.download_url(&created.slug, meta.files[0].id, None).await.unwrap();
        let b = h.service.download_url(&created.slug, meta.files[0].id, None).await.unwrap();
        assert_ne!(a.download_url, b.download_url);
        assert_eq!(a.expires_in_secs, 300);

        let err = h
            .service
            .download_url(&created.slug, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_object_degrades_to_not_found() {
        let h = harness().await;
        let file = h.upload("gone.txt", 10).await;
        let key = file.key.clone();
        let created = h.transfer_with(vec![file]).await;
        h.storage.delete_file(&key).await.unwrap();

        let meta = h.service.get_transfer_meta(&created.slug).await.unwrap();
        let err = h
            .service
            .download_url(&created.slug, meta.files[0].id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_transfer_is_unreadable_before_any_sweep() {
        let h = harness().await;
        let file = h.upload("a.txt", 10).await;
        let created = h.transfer_with(vec![file]).await;

        let later = Utc::now() + ChronoDuration::days(8);
        let err = h
            .service
            .get_transfer_meta_at(later, &created.slug)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let status: TransferStatus = sqlx::query_scalar("SELECT status FROM transfers WHERE id = ?")
            .bind(created.id)
            .fetch_one(&h.db)
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Active);
    }

    #[tokio::test]
    async fn owner_delete_removes_objects_and_slug() {
        let h = harness().await;
        let a = h.upload("a.txt", 10).await;
        let b = h.upload("b.txt", 10).await;
        let keys = [a.key.clone(), b.key.clone()];
        let created = h.transfer_with(vec![a, b]).await;

        let stranger = Owner::new(Uuid::new_v4(), Plan::Free);
        let err = h.service.delete_transfer(&stranger, created.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        h.service.delete_transfer(&h.owner, created.id).await.unwrap();
        for key in &keys {
            assert!(!h.storage.object_exists(key));
        }
        let transfer = h.service.find_transfer(created.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Deleted);
        assert!(transfer.cleanup_completed_at.is_some());

        let err = h.service.get_transfer_meta(&created.slug).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_delete_failure_leaves_transfer_deleting() {
        let h = harness().await;
        let mut files = Vec::new();
        for i in 0..5 {
            files.push(h.upload(&format!("f{}.bin", i), 10).await);
        }
        let failing: Vec<String> = files.iter().take(3).map(|f| f.key.clone()).collect();
        let created = h.transfer_with(files).await;
        h.storage.fail_deletes_for(failing.clone());

        let err = h.service.delete_transfer(&h.owner, created.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::StorageTransient(_)));

        let transfer = h.service.find_transfer(created.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Deleting);
        assert!(transfer.cleanup_completed_at.is_none());
        for key in &failing {
            assert!(h.storage.object_exists(key));
        }
        let err = h.service.get_transfer_meta(&created.slug).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        // Retrying the delete picks up only what is left.
        h.storage.clear_delete_failures();
        h.service.delete_transfer(&h.owner, created.id).await.unwrap();
        let transfer = h.service.find_transfer(created.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Deleted);
    }

    #[tokio::test]
    async fn owner_listing_shows_own_transfers_only() {
        let h = harness().await;
        let file = h.upload("a.txt", 10).await;
        let created = h.transfer_with(vec![file]).await;

        let rows = h.service.list_transfers(&h.owner).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].slug, created.slug);
        assert_eq!(rows[0].file_count, 1);
        assert!(!rows[0].requires_password);

        let other = Owner::new(Uuid::new_v4(), Plan::Pro);
        assert!(h.service.list_transfers(&other).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_creates_on_a_file_database_all_succeed() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("fileshare.db").display());
        let db = crate::db::connect(&url).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let storage = Arc::new(MockStorage::new("test-bucket", std::time::Duration::from_secs(60)));
        let service = TransferService::new(
            db.clone(),
            storage.clone(),
            Arc::new(AppConfig::for_tests()),
        );

        let mut tasks = Vec::new();
        for i in 0..24 {
            let owner = Owner::new(Uuid::new_v4(), Plan::Free);
            let name = format!("f{}.bin", i);
            let key = seed_completed_upload(&db, &storage, &owner, &name, 10).await;
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service
                    .create_transfer(
                        &owner,
                        CreateTransferInput {
                            files: vec![TransferFileInput {
                                key,
                                name,
                                size_bytes: 10,
                                content_type: None,
                            }],
                            ..Default::default()
                        },
                    )
                    .await
            }));
        }

        let mut slugs = HashSet::new();
        for task in tasks {
            let created = task.await.unwrap().unwrap();
            slugs.insert(created.slug);
        }
        assert_eq!(slugs.len(), 24);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfers")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 24);
    }

    #[tokio::test]
    async fn owner_delete_after_expiry_leaves_it_to_the_sweep() {
        let h = harness().await;
        let file = h.upload("late.txt", 10).await;
        let key = file.key.clone();
        let created = h.transfer_with(vec![file]).await;

        let later = Utc::now() + ChronoDuration::days(8);
        let err = h
            .service
            .delete_transfer_at(later, &h.owner, created.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let transfer = h.service.find_transfer(created.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Active);
        assert!(transfer.closed_at.is_none());
        assert!(h.storage.object_exists(&key));
    }
}
