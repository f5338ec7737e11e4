//! Operator endpoints for the expiration sweep.

use axum::{Json, extract::State};

use crate::{
    auth::AdminAccess,
    errors::AppError,
    services::cleanup_service::{SweepReport, SweepStats},
    state::AppState,
};

/// `GET /admin/cleanup`
pub async fn cleanup_stats(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> Result<Json<SweepStats>, AppError> {
    Ok(Json(state.cleanup.sweep_stats().await?))
}

/// `POST /admin/cleanup`
pub async fn run_cleanup(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> Result<Json<SweepReport>, AppError> {
    tracing::info!("expiration sweep requested");
    Ok(Json(state.cleanup.run_expiration_sweep().await?))
}
