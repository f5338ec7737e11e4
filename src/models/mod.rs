//! Core data models for the transfer service.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize as
//! JSON via `serde`. Request/response payloads live next to the handlers.

pub mod file_object;
pub mod notification;
pub mod plan;
pub mod transfer;
pub mod upload;
