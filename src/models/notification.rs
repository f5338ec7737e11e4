//! Per-recipient notification records and their telemetry counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Links a transfer to one recipient address. `token` is appended to the
/// share link and correlates open/click events.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Notification {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub email: String,
    pub token: String,
    pub message: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub open_count: i64,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub click_count: i64,
    pub first_clicked_at: Option<DateTime<Utc>>,
}
