//! Storage key generation shared by every backend.
//!
//! Key format: `uploads/{yyyy}/{mm}/{dd}/{unix_millis}-{random}-{name}`. The
//! random component makes keys unguessable; the sanitized name keeps them
//! readable in bucket listings.

use chrono::Utc;
use rand::RngCore;

use super::{StorageError, StorageResult};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_NAME_SEGMENT_LEN: usize = 100;

/// Generate a fresh, collision-resistant key for `file_name`.
pub fn generate_storage_key(file_name: &str) -> String {
    let now = Utc::now();
    let mut random = [0u8; 8];
    rand::rng().fill_bytes(&mut random);
    let random_hex: String = random.iter().map(|b| format!("{:02x}", b)).collect();

    format!(
        "uploads/{}/{}-{}-{}",
        now.format("%Y/%m/%d"),
        now.timestamp_millis(),
        random_hex,
        sanitize_file_name(file_name)
    )
}

/// Reduce a client-supplied name to `[A-Za-z0-9._-]`, dropping any directory
/// part. Never returns an empty string.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();

    let mut out = String::with_capacity(base.len().min(MAX_NAME_SEGMENT_LEN));
    let mut last_was_sep = false;
    for c in base.chars() {
        if out.len() >= MAX_NAME_SEGMENT_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }

    let trimmed = out.trim_start_matches(['.', '_']).trim_end_matches('_');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Basic validation for keys echoed back by clients.
///
/// Rejects empty or oversized keys, keys outside the upload prefix, and
/// anything resembling path traversal.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidKey("key length out of range".into()));
    }
    if !key.starts_with("uploads/") {
        return Err(StorageError::InvalidKey("unexpected key prefix".into()));
    }
    if key.contains("..") {
        return Err(StorageError::InvalidKey("key contains `..`".into()));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidKey("key contains control characters".into()));
    }
    Ok(())
}
