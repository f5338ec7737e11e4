//! Notification dispatcher.
//!
//! Recipients are recorded first and mailed afterwards, one independent send
//! per address. Open and click hits are counted against the per-recipient
//! token and never influence delivery.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lettre::Address;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::{collections::HashSet, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    auth::Owner,
    config::AppConfig,
    db,
    errors::{ServiceError, ServiceResult},
    models::notification::{DeliveryStatus, Notification},
    services::{
        mailer::{MailError, Mailer, OutgoingEmail},
        transfer_service::TransferService,
    },
};

pub const MAX_RECIPIENTS: usize = 50;
const MAX_MESSAGE_LEN: usize = 2000;
const TOKEN_BYTES: usize = 16;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingRecipient {
    pub id: Uuid,
    pub email: String,
    pub token: String,
}

/// Recipients recorded for one transfer and ready to be mailed.
#[derive(Debug, Clone)]
pub struct NotificationBatch {
    pub transfer_id: Uuid,
    pub slug: String,
    pub expires_at: DateTime<Utc>,
    pub message: Option<String>,
    pub recipients: Vec<PendingRecipient>,
}

impl NotificationBatch {
    pub fn addresses(&self) -> Vec<String> {
        self.recipients.iter().map(|r| r.email.clone()).collect()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DispatchReport {
    pub sent: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct NotificationService {
    db: SqlitePool,
    mailer: Arc<dyn Mailer>,
    transfers: TransferService,
    config: Arc<AppConfig>,
    retry_delay: Duration,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl NotificationService {
    pub fn new(
        db: SqlitePool,
        mailer: Arc<dyn Mailer>,
        transfers: TransferService,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            mailer,
            transfers,
            config,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Base delay between attempts; attempt `n` waits `n * delay`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Share page on the front end, tagged with the recipient's token.
    pub fn share_link(&self, slug: &str, token: &str) -> String {
        format!("{}/s/{}?r={}", self.config.share_url, slug, token)
    }

    /// Link placed in the email. It counts the click, then redirects to
    /// [`Self::share_link`].
    pub fn click_link(&self, token: &str) -> String {
        format!("{}/t/click/{}", self.config.public_url, token)
    }

    /// Validate the request and persist one pending record per distinct
    /// recipient.
    #[tracing::instrument(skip(self, owner, request), fields(owner_id = %owner.id))]
    pub async fn prepare(
        &self,
        owner: &Owner,
        transfer_id: Uuid,
        request: NotifyRequest,
    ) -> ServiceResult<NotificationBatch> {
        let transfer = self
            .transfers
            .find_transfer(transfer_id)
            .await?
            .ok_or_else(ServiceError::not_found)?;
        if transfer.owner_id != owner.id {
            tracing::warn!(transfer_id = %transfer_id, "notify attempted by non-owner");
            return Err(ServiceError::Forbidden("transfer belongs to another user".into()));
        }
        let now = Utc::now();
        if !transfer.is_readable_at(now) {
            return Err(ServiceError::not_found());
        }

        let recipients = normalize_recipients(&request.recipients)?;
        let message = request
            .message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if message.as_ref().is_some_and(|m| m.len() > MAX_MESSAGE_LEN) {
            return Err(ServiceError::Validation(format!(
                "message is limited to {} bytes",
                MAX_MESSAGE_LEN
            )));
        }

        let mut tx = db::begin_write(&self.db).await?;
        let mut pending = Vec::with_capacity(recipients.len());
        for email in recipients {
            let record = PendingRecipient {
                id: Uuid::new_v4(),
                email,
                token: generate_token(),
            };
            sqlx::query(
                "INSERT INTO notifications (
                    id, transfer_id, email, token, message, status, attempts, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
            )
            .bind(record.id)
            .bind(transfer_id)
            .bind(&record.email)
            .bind(&record.token)
            .bind(message.as_deref())
            .bind(DeliveryStatus::Pending)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            pending.push(record);
        }
        tx.commit().await?;

        Ok(NotificationBatch {
            transfer_id,
            slug: transfer.slug,
            expires_at: transfer.expires_at,
            message,
            recipients: pending,
        })
    }

    /// Mail every recipient of `batch` concurrently. A failure for one
    /// address never affects the others.
    pub async fn dispatch(&self, batch: NotificationBatch) -> DispatchReport {
        let sends = batch
            .recipients
            .iter()
            .map(|recipient| self.deliver(&batch, recipient));
        let outcomes = join_all(sends).await;

        let mut report = DispatchReport::default();
        for (recipient, delivered) in batch.recipients.iter().zip(outcomes) {
            if delivered {
                report.sent.push(recipient.email.clone());
            } else {
                report.failed.push(recipient.email.clone());
            }
        }
        tracing::info!(
            transfer_id = %batch.transfer_id,
            sent = report.sent.len(),
            failed = report.failed.len(),
            "notifications dispatched"
        );
        report
    }

    pub async fn notify(
        &self,
        owner: &Owner,
        transfer_id: Uuid,
        request: NotifyRequest,
    ) -> ServiceResult<DispatchReport> {
        let batch = self.prepare(owner, transfer_id, request).await?;
        Ok(self.dispatch(batch).await)
    }

    async fn deliver(&self, batch: &NotificationBatch, recipient: &PendingRecipient) -> bool {
        let email = self.compose(batch, recipient);
        let max_attempts = self.config.notify_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.mailer.send(&email).await {
                Ok(()) => {
                    self.record_attempt(recipient.id, attempt, DeliveryStatus::Sent, None)
                        .await;
                    tracing::info!(to = %recipient.email, attempt, "notification sent");
                    return true;
                }
                Err(err) => {
                    let permanent = matches!(
                        err,
                        MailError::InvalidAddress(_) | MailError::Rejected(_)
                    );
                    let last = permanent || attempt == max_attempts;
                    tracing::warn!(to = %recipient.email, attempt, error = %err, "notification attempt failed");
                    let status = if last {
                        DeliveryStatus::Failed
                    } else {
                        DeliveryStatus::Pending
                    };
                    self.record_attempt(recipient.id, attempt, status, Some(err.to_string()))
                        .await;
                    if last {
                        return false;
                    }
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        }
        false
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        let sent_at = (status == DeliveryStatus::Sent).then(Utc::now);
        let result = sqlx::query(
            "UPDATE notifications
             SET status = ?, attempts = ?, last_error = ?, sent_at = COALESCE(?, sent_at)
             WHERE id = ?",
        )
        .bind(status)
        .bind(i64::from(attempt))
        .bind(error)
        .bind(sent_at)
        .bind(id)
        .execute(&self.db)
        .await;
        if let Err(err) = result {
            tracing::error!(notification_id = %id, error = %err, "failed to record delivery attempt");
        }
    }

    fn compose(&self, batch: &NotificationBatch, recipient: &PendingRecipient) -> OutgoingEmail {
        let link = self.click_link(&recipient.token);
        let pixel = format!("{}/t/open/{}", self.config.public_url, recipient.token);
        let expires = batch.expires_at.format("%Y-%m-%d %H:%M UTC");

        let mut text = String::from("Files have been shared with you.\n\n");
        if let Some(message) = &batch.message {
            text.push_str(message);
            text.push_str("\n\n");
        }
        text.push_str(&format!("Download: {}\nAvailable until {}.\n", link, expires));

        let note = batch
            .message
            .as_deref()
            .map(|m| format!("<p>{}</p>", escape_html(m)))
            .unwrap_or_default();
        let html = format!(
            "<p>Files have been shared with you.</p>{}\
             <p><a href=\"{}\">Download files</a></p>\
             <p>Available until {}.</p>\
             <img src=\"{}\" width=\"1\" height=\"1\" alt=\"\">",
            note,
            escape_html(&link),
            expires,
            escape_html(&pixel)
        );

        OutgoingEmail {
            to: recipient.email.clone(),
            subject: "Files shared with you".into(),
            text,
            html,
        }
    }

    /// Count an open. Unknown tokens are ignored.
    pub async fn record_open(&self, token: &str) -> ServiceResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications
             SET open_count = open_count + 1, first_opened_at = COALESCE(first_opened_at, ?)
             WHERE token = ?",
        )
        .bind(Utc::now())
        .bind(token)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count a click and return the share link it stands for.
    pub async fn record_click(&self, token: &str) -> ServiceResult<Option<String>> {
        let slug: Option<String> = sqlx::query_scalar(
            "SELECT t.slug FROM notifications n JOIN transfers t ON t.id = n.transfer_id
             WHERE n.token = ?",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        let Some(slug) = slug else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE notifications
             SET click_count = click_count + 1, first_clicked_at = COALESCE(first_clicked_at, ?)
             WHERE token = ?",
        )
        .bind(Utc::now())
        .bind(token)
        .execute(&self.db)
        .await?;
        Ok(Some(self.share_link(&slug, token)))
    }

    /// Delivery and engagement per recipient, for the transfer's owner.
    pub async fn list_for_transfer(
        &self,
        owner: &Owner,
        transfer_id: Uuid,
    ) -> ServiceResult<Vec<Notification>> {
        let transfer = self
            .transfers
            .find_transfer(transfer_id)
            .await?
            .ok_or_else(ServiceError::not_found)?;
        if transfer.owner_id != owner.id {
            return Err(ServiceError::Forbidden("transfer belongs to another user".into()));
        }

        let rows = sqlx::query_as::<_, Notification>(
            "SELECT id, transfer_id, email, token, message, status, attempts, last_error,
                    created_at, sent_at, open_count, first_opened_at, click_count, first_clicked_at
             FROM notifications WHERE transfer_id = ? ORDER BY created_at ASC, email ASC",
        )
        .bind(transfer_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}

/// Trim, validate and de-duplicate (case-insensitively) recipient addresses.
fn normalize_recipients(raw: &[String]) -> ServiceResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for entry in raw {
        let email = entry.trim();
        email
            .parse::<Address>()
            .map_err(|_| ServiceError::Validation(format!("invalid email address `{}`", email)))?;
        if seen.insert(email.to_ascii_lowercase()) {
            recipients.push(email.to_string());
        }
    }

    if recipients.is_empty() {
        return Err(ServiceError::Validation("at least one recipient is required".into()));
    }
    if recipients.len() > MAX_RECIPIENTS {
        return Err(ServiceError::Validation(format!(
            "at most {} recipients per request",
            MAX_RECIPIENTS
        )));
    }
    Ok(recipients)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
