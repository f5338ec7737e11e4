//! Expiration sweep.
//!
//! Run on demand (admin endpoint or `--sweep` from cron), never as a
//! background loop inside the server. Every step is conditional on the
//! current row state, so overlapping runs do not double count or fail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::HashSet, sync::Arc};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    errors::ServiceResult,
    models::transfer::{Transfer, TransferStatus},
    services::{
        transfer_service::{TRANSFER_COLUMNS, TransferService},
        upload_service::UploadService,
    },
};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Transfers newly marked expired by this run.
    pub processed: u64,
    /// Storage objects removed by this run.
    pub deleted: u64,
    /// Closed transfers whose leftover objects were retried.
    pub retried: u64,
    pub orphans_reaped: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub expired_count: i64,
    pub total_size_bytes: i64,
    pub oldest_expired: Option<DateTime<Utc>>,
    pub pending_cleanup_files: i64,
    pub orphaned_uploads: i64,
}

#[derive(Clone)]
pub struct CleanupService {
    db: SqlitePool,
    transfers: TransferService,
    uploads: UploadService,
    config: Arc<AppConfig>,
}

impl CleanupService {
    pub fn new(
        db: SqlitePool,
        transfers: TransferService,
        uploads: UploadService,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            transfers,
            uploads,
            config,
        }
    }

    pub async fn run_expiration_sweep(&self) -> ServiceResult<SweepReport> {
        self.run_expiration_sweep_at(Utc::now(), self.config.sweep.batch_size)
            .await
    }

    /// Expire due transfers, retry leftover deletes, then reap orphaned
    /// uploads. Per-item failures land in `errors` and never stop the run.
    #[tracing::instrument(skip(self))]
    pub async fn run_expiration_sweep_at(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> ServiceResult<SweepReport> {
        let batch_size = batch_size.max(1);
        let mut report = SweepReport::default();

        let due = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {} FROM transfers
             WHERE status = ? AND expires_at <= ?
             ORDER BY expires_at ASC
             LIMIT ?",
            TRANSFER_COLUMNS
        ))
        .bind(TransferStatus::Active)
        .bind(now)
        .bind(i64::from(batch_size))
        .fetch_all(&self.db)
        .await?;

        let mut handled = HashSet::new();
        for transfer in due {
            handled.insert(transfer.id);
            self.expire_one(&transfer, now, &mut report).await;
        }

        // Least recently attempted first (never-attempted sorts first), so
        // objects that keep failing do not hold the batch.
        let leftovers: Vec<Uuid> = sqlx::query_scalar(
            "SELECT t.id FROM transfers t
             WHERE t.status != ?
               AND EXISTS (
                   SELECT 1 FROM file_objects f
                   WHERE f.transfer_id = t.id AND f.deleted_at IS NULL
               )
             ORDER BY t.cleanup_attempted_at ASC, t.closed_at ASC
             LIMIT ?",
        )
        .bind(TransferStatus::Active)
        .bind(i64::from(batch_size))
        .fetch_all(&self.db)
        .await?;

        for id in leftovers.into_iter().filter(|id| !handled.contains(id)) {
            report.retried += 1;
            self.purge_one(id, now, &mut report).await;
        }

        // Deleting transfers whose objects went away in an earlier run that
        // stopped before the status update.
        let stalled: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM transfers
             WHERE status != ? AND cleanup_completed_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM file_objects f
                   WHERE f.transfer_id = transfers.id AND f.deleted_at IS NULL
               )
             LIMIT ?",
        )
        .bind(TransferStatus::Active)
        .bind(i64::from(batch_size))
        .fetch_all(&self.db)
        .await?;
        for id in stalled {
            if let Err(err) = self.transfers.finalize_cleanup(id, now).await {
                report.errors.push(format!("transfer {}: {}", id, err));
            }
        }

        match self
            .uploads
            .reap_orphans_at(now, self.config.sweep.orphan_grace, batch_size)
            .await
        {
            Ok(orphans) => {
                report.orphans_reaped = orphans.reaped;
                report.errors.extend(orphans.errors);
            }
            Err(err) => {
                tracing::error!(error = %err, "orphan reaping failed");
                report.errors.push(format!("orphan reaping: {}", err));
            }
        }

        tracing::info!(
            processed = report.processed,
            deleted = report.deleted,
            retried = report.retried,
            orphans_reaped = report.orphans_reaped,
            errors = report.errors.len(),
            "expiration sweep finished"
        );
        Ok(report)
    }

    /// Delete first, then expire regardless of how the deletes went.
    async fn expire_one(&self, transfer: &Transfer, now: DateTime<Utc>, report: &mut SweepReport) {
        tracing::info!(
            transfer_id = %transfer.id,
            expires_at = %transfer.expires_at,
            "expiring transfer"
        );
        self.purge_one(transfer.id, now, report).await;

        let expired = sqlx::query(
            "UPDATE transfers SET status = ?, closed_at = COALESCE(closed_at, ?)
             WHERE id = ? AND status = ?",
        )
        .bind(TransferStatus::Expired)
        .bind(now)
        .bind(transfer.id)
        .bind(TransferStatus::Active)
        .execute(&self.db)
        .await;

        match expired {
            Ok(result) if result.rows_affected() == 1 => {
                report.processed += 1;
                if let Err(err) = self.transfers.finalize_cleanup(transfer.id, now).await {
                    report.errors.push(format!("transfer {}: {}", transfer.id, err));
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(transfer_id = %transfer.id, error = %err, "failed to mark transfer expired");
                report
                    .errors
                    .push(format!("transfer {}: {}", transfer.id, err));
            }
        }
    }

    async fn purge_one(&self, id: Uuid, now: DateTime<Utc>, report: &mut SweepReport) {
        match self.transfers.purge_files(id, now).await {
            Ok(outcome) => {
                report.deleted += outcome.deleted;
                for (key, err) in outcome.failed {
                    tracing::warn!(transfer_id = %id, key = %key, error = %err, "object delete failed, will retry");
                    report
                        .errors
                        .push(format!("transfer {}: {}: {}", id, key, err));
                }
                if let Err(err) = self.transfers.finalize_cleanup(id, now).await {
                    report.errors.push(format!("transfer {}: {}", id, err));
                }
            }
            Err(err) => {
                tracing::warn!(transfer_id = %id, error = %err, "object cleanup failed");
                report.errors.push(format!("transfer {}: {}", id, err));
            }
        }
    }

    pub async fn sweep_stats(&self) -> ServiceResult<SweepStats> {
        self.sweep_stats_at(Utc::now()).await
    }

    /// What the next sweep would pick up.
    pub async fn sweep_stats_at(&self, now: DateTime<Utc>) -> ServiceResult<SweepStats> {
        let (expired_count, total_size_bytes, oldest_expired): (i64, i64, Option<DateTime<Utc>>) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(total_size_bytes), 0), MIN(expires_at)
                 FROM transfers WHERE status = ? AND expires_at <= ?",
            )
            .bind(TransferStatus::Active)
            .bind(now)
            .fetch_one(&self.db)
            .await?;

        let pending_cleanup_files: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_objects f
             JOIN transfers t ON t.id = f.transfer_id
             WHERE t.status != ? AND f.deleted_at IS NULL",
        )
        .bind(TransferStatus::Active)
        .fetch_one(&self.db)
        .await?;

        let orphaned_uploads = self
            .uploads
            .count_orphans(self.config.sweep.orphan_grace)
            .await?;

        Ok(SweepStats {
            expired_count,
            total_size_bytes,
            oldest_expired,
            pending_cleanup_files,
            orphaned_uploads,
        })
    }
}
