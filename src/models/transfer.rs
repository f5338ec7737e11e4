//! Represents a transfer: the shareable bundle of files behind a slug.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a transfer.
///
/// `Active -> Expired` is driven by the sweep; `Active -> Deleting -> Deleted`
/// by the owner. Every non-active state reads as not found.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Active,
    Expired,
    /// Owner asked for deletion; some backing objects may still exist.
    Deleting,
    Deleted,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Transfer {
    pub id: Uuid,

    /// Unguessable, URL-safe, immutable public identifier.
    pub slug: String,

    pub owner_id: Uuid,

    /// Sum of the attached files' sizes, fixed at creation.
    pub total_size_bytes: i64,

    pub status: TransferStatus,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Argon2 PHC string; never the plaintext.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,

    pub branding_id: Option<String>,

    /// When the transfer left the active state.
    pub closed_at: Option<DateTime<Utc>>,

    /// When the last backing object was confirmed gone.
    pub cleanup_completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Readable by slug holders: active and not yet past its expiry. The
    /// expiry check here does not wait for the sweep.
    pub fn is_readable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TransferStatus::Active && self.expires_at > now
    }

    pub fn requires_password(&self) -> bool {
        self.password_hash.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn transfer(status: TransferStatus, expires_in: Duration) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: Uuid::new_v4(),
            slug: "abc".into(),
            owner_id: Uuid::new_v4(),
            total_size_bytes: 1,
            status,
            created_at: now,
            expires_at: now + expires_in,
            password_hash: None,
            branding_id: None,
            closed_at: None,
            cleanup_completed_at: None,
        }
    }

    #[test]
    fn past_expiry_is_unreadable_even_while_active() {
        let t = transfer(TransferStatus::Active, Duration::seconds(-1));
        assert!(!t.is_readable_at(Utc::now()));
    }

    #[test]
    fn only_active_transfers_are_readable() {
        for status in [
            TransferStatus::Expired,
            TransferStatus::Deleting,
            TransferStatus::Deleted,
        ] {
            assert!(!transfer(status, Duration::days(1)).is_readable_at(Utc::now()));
        }
        assert!(transfer(TransferStatus::Active, Duration::days(1)).is_readable_at(Utc::now()));
    }
}
