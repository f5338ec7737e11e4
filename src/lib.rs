//! File transfer service: multipart uploads into object storage, expiring
//! share links and recipient notifications.

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
