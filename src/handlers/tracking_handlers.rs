//! Open and click tracking. Best effort: failures are logged and the
//! response does not change.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};

use crate::state::AppState;

/// `GET /t/open/{token}`
pub async fn track_open(State(state): State<AppState>, Path(token): Path<String>) -> StatusCode {
    if let Err(err) = state.notifications.record_open(&token).await {
        tracing::warn!(error = %err, "failed to record open");
    }
    StatusCode::NO_CONTENT
}

/// `GET /t/click/{token}`
pub async fn track_click(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.notifications.record_click(&token).await {
        Ok(Some(link)) => Redirect::to(&link).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to record click");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
