use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;

use crate::auth::RequireAdmin;
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::store::Store;
use crate::types::{AuditEntry, Workspace};

fn load_workspace(store: &dyn Store, id: &str) -> Result<Workspace, ApiError> {
    store
        .get_workspace(id)
        .api_err("Failed to get workspace")?
        .or_not_found("Workspace not found")
}

fn audit(store: &dyn Store, action: &str, workspace: &Workspace, admin: &RequireAdmin) {
    let entry = AuditEntry::new(action)
        .in_workspace(&workspace.id)
        .resource("workspace", &workspace.id)
        .details(json!({ "admin_token_id": admin.0.id }));
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for {action}: {e}");
    }
}

pub async fn get_workspace(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let workspace = load_workspace(state.store.as_ref(), &id)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(workspace)))
}

pub async fn cancel_workspace(
    admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let existing = load_workspace(store, &id)?;

    let workspace = store
        .cancel_workspace(&existing.id, Utc::now())
        .api_err("Failed to cancel workspace")?;

    if !existing.is_cancelled() {
        tracing::info!(workspace_id = %workspace.id, "Workspace cancelled by admin");
        audit(store, "workspace.cancelled", &workspace, &admin);
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(workspace)))
}

pub async fn reactivate_workspace(
    admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let existing = load_workspace(store, &id)?;

    let workspace = store
        .reactivate_workspace(&existing.id)
        .api_err("Failed to reactivate workspace")?;

    if existing.is_read_only {
        tracing::info!(workspace_id = %workspace.id, "Workspace reactivated by admin");
        audit(store, "workspace.reactivated", &workspace, &admin);
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(workspace)))
}
