use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::auth::RequireUser;
use crate::server::AppState;
use crate::server::dto::WorkspaceResponse;
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::store::Store;
use crate::types::{AuditEntry, Plan, Role, Workspace};

use super::access::require_member;

fn to_response(
    store: &dyn Store,
    workspace: Workspace,
    plan: Plan,
    role: Role,
) -> Result<WorkspaceResponse, ApiError> {
    let member_count = store
        .count_members(&workspace.id)
        .api_err("Failed to count members")?;
    let project_count = store
        .count_projects(&workspace.id)
        .api_err("Failed to count projects")?;
    let can_export = workspace.can_export(Utc::now());

    Ok(WorkspaceResponse {
        workspace,
        plan,
        my_role: role,
        member_count,
        project_count,
        can_export,
    })
}

pub async fn list_workspaces(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let store = state.store.as_ref();

    let plans: HashMap<String, Plan> = store
        .list_plans()
        .api_err("Failed to list plans")?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let workspaces = store
        .list_user_workspaces(&auth.user.id)
        .api_err("Failed to list workspaces")?;

    let responses = workspaces
        .into_iter()
        .map(|(workspace, role)| {
            let plan = plans
                .get(&workspace.plan_id)
                .cloned()
                .ok_or_else(|| ApiError::internal("Workspace references unknown plan"))?;
            to_response(store, workspace, plan, role)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok::<_, ApiError>(Json(ApiResponse::success(responses)))
}

pub async fn get_workspace(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;

    let plan = store
        .get_plan(&access.workspace.plan_id)
        .api_err("Failed to get plan")?
        .or_not_found("Plan not found")?;

    let response = to_response(store, access.workspace, plan, access.role)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(response)))
}

/// Streams the workspace's files as a `.tar.gz`. Cancelled workspaces can be
/// exported until their deletion deadline.
pub async fn export_workspace(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;
    access.require_readable()?;

    let (archive, size) = state
        .storage
        .export_workspace(&access.workspace.id)
        .await
        .map_err(|e| {
            tracing::error!(workspace_id = %access.workspace.id, "Failed to build export: {e}");
            ApiError::internal("Failed to export workspace")
        })?;

    let entry = AuditEntry::new("workspace.exported")
        .by_user(&auth.user.id)
        .in_workspace(&access.workspace.id)
        .resource("workspace", &access.workspace.id)
        .details(json!({ "archive_bytes": size }));
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for workspace.exported: {e}");
    }

    let filename = format!("workspace_{}.tar.gz", access.workspace.id);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/gzip")
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(ReaderStream::new(archive)))
        .map_err(|_| ApiError::internal("Failed to build response"))
}
