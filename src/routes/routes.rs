//! Defines routes for the upload, transfer and share-link API.
//!
//! ## Structure
//! - **Uploads** (owner)
//!   - `POST /upload/create`, `/upload/parts`, `/upload/complete`, `/upload/abort`
//! - **Transfers** (owner)
//!   - `POST   /transfers/create`
//!   - `GET    /transfers`
//!   - `DELETE /transfers/{id}`
//!   - `POST   /transfers/{id}/notify`, `GET /transfers/{id}/notifications`
//! - **Share links** (public)
//!   - `GET /share/{slug}`, `GET /share/{slug}/download`
//! - **Tracking** (public): `GET /t/open/{token}`, `GET /t/click/{token}`
//! - **Admin**: `GET|POST /admin/cleanup`

use crate::{
    handlers::{
        admin_handlers::{cleanup_stats, run_cleanup},
        health_handlers::{healthz, readyz},
        share_handlers::{download, get_share},
        tracking_handlers::{track_click, track_open},
        transfer_handlers::{
            create_transfer, delete_transfer, list_notifications, list_transfers,
            notify_recipients,
        },
        upload_handlers::{abort_upload, complete_upload, create_upload, upload_part},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Upper bound for one relayed part, multipart framing included. Parts grow
/// past the configured size only for files that would need over 10,000.
const PART_BODY_LIMIT: usize = 128 * 1024 * 1024;

/// Build and return the router with every route. The router carries
/// [`AppState`] to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Uploads
        .route("/upload/create", post(create_upload))
        .route(
            "/upload/parts",
            post(upload_part).layer(DefaultBodyLimit::max(PART_BODY_LIMIT)),
        )
        .route("/upload/complete", post(complete_upload))
        .route("/upload/abort", post(abort_upload))
        // Transfers
        .route("/transfers", get(list_transfers))
        .route("/transfers/create", post(create_transfer))
        .route("/transfers/{id}", delete(delete_transfer))
        .route("/transfers/{id}/notify", post(notify_recipients))
        .route("/transfers/{id}/notifications", get(list_notifications))
        // Share links
        .route("/share/{slug}", get(get_share))
        .route("/share/{slug}/download", get(download))
        // Tracking
        .route("/t/open/{token}", get(track_open))
        .route("/t/click/{token}", get(track_click))
        // Admin
        .route("/admin/cleanup", get(cleanup_stats).post(run_cleanup))
}
