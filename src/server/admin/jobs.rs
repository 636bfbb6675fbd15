use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use chrono::Utc;

use crate::auth::RequireAdmin;
use crate::jobs;
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

pub async fn storage_reconciliation(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let report = jobs::reconcile_storage(state.store.as_ref(), &state.storage)
        .await
        .api_err("Storage reconciliation failed")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(report)))
}

pub async fn purge_deleted_workspaces(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let report = jobs::purge_expired_workspaces(state.store.as_ref(), &state.storage, Utc::now())
        .await
        .api_err("Workspace purge failed")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(report)))
}

pub async fn cleanup_expired_oauth_states(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let report = jobs::cleanup_expired_oauth_states(state.store.as_ref(), Utc::now())
        .api_err("OAuth state cleanup failed")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(report)))
}
