//! Owner-facing transfer endpoints. Every handler requires an [`Owner`].

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::Owner,
    errors::AppError,
    models::notification::Notification,
    services::{
        notification_service::NotifyRequest,
        transfer_service::{CreateTransferInput, TransferSummary},
    },
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct TransferList {
    pub transfers: Vec<TransferSummary>,
}

#[derive(Debug, Serialize)]
pub struct NotifyAccepted {
    pub queued: Vec<String>,
}

/// `POST /transfers/create`
pub async fn create_transfer(
    State(state): State<AppState>,
    owner: Owner,
    Json(input): Json<CreateTransferInput>,
) -> Result<impl IntoResponse, AppError> {
    let created = state.transfers.create_transfer(&owner, input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /transfers`
pub async fn list_transfers(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<TransferList>, AppError> {
    let transfers = state.transfers.list_transfers(&owner).await?;
    Ok(Json(TransferList { transfers }))
}

/// `DELETE /transfers/{id}`
pub async fn delete_transfer(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.transfers.delete_transfer(&owner, id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// `POST /transfers/{id}/notify`
///
/// Records the recipients, answers 202 and sends in the background.
pub async fn notify_recipients(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
    Json(req): Json<NotifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state.notifications.prepare(&owner, id, req).await?;
    let queued = batch.addresses();

    let notifications = state.notifications.clone();
    tokio::spawn(async move {
        notifications.dispatch(batch).await;
    });

    Ok((StatusCode::ACCEPTED, Json(NotifyAccepted { queued })))
}

/// `GET /transfers/{id}/notifications`
pub async fn list_notifications(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let rows = state.notifications.list_for_transfer(&owner, id).await?;
    Ok(Json(rows))
}
