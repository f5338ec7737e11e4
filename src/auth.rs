//! Identity at the service boundary.
//!
//! Authentication itself happens upstream: the auth proxy in front of this
//! service injects the caller's id and plan as headers. These extractors only
//! read and validate them.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{errors::AppError, models::plan::Plan, state::AppState};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_PLAN_HEADER: &str = "x-user-plan";

/// The authenticated user acting on their own uploads and transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub id: Uuid,
    pub plan: Plan,
}

impl Owner {
    pub fn new(id: Uuid, plan: Plan) -> Self {
        Self { id, plan }
    }
}

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;
        let id = Uuid::parse_str(id.trim())
            .map_err(|_| AppError::unauthorized("malformed user id"))?;

        let plan = match parts.headers.get(USER_PLAN_HEADER) {
            None => Plan::Free,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<Plan>().ok())
                .ok_or_else(|| AppError::bad_request("unsupported plan"))?,
        };

        Ok(Owner { id, plan })
    }
}

/// Operator access to the admin endpoints.
///
/// When no admin token is configured the endpoints are open, which is only
/// meant for deployments that restrict them at the network layer.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            return Ok(AdminAccess);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(AdminAccess)
        } else {
            tracing::warn!("rejected admin request with invalid token");
            Err(AppError::unauthorized("admin token required"))
        }
    }
}
