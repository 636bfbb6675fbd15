use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use crate::auth::RequireUser;
use crate::server::AppState;
use crate::server::dto::AuditLogParams;
use crate::server::response::{ApiError, ApiResponse, DEFAULT_PAGE_SIZE, StoreResultExt};
use crate::types::Role;

use super::access::require_member;

const MAX_AUDIT_ENTRIES: i32 = 500;

/// Most recent audit entries for a workspace, newest first. ADMIN only.
pub async fn list_audit_log(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<AuditLogParams>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;
    access.require_role(Role::Admin)?;

    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_AUDIT_ENTRIES);

    let entries = store
        .list_audit_entries(&access.workspace.id, limit)
        .api_err("Failed to list audit log")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(entries)))
}
