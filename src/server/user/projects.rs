use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::auth::RequireUser;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{CreateProjectRequest, ListProjectsParams, UpdateProjectRequest};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::server::validation::{validate_description, validate_project_name};
use crate::store::Store;
use crate::types::{AuditEntry, Project, Role};

use super::access::{require_member, require_project};

fn audit(store: &dyn Store, action: &str, actor: &str, project: &Project) {
    let entry = AuditEntry::new(action)
        .by_user(actor)
        .in_workspace(&project.workspace_id)
        .resource("project", &project.id)
        .details(json!({ "name": project.name }));
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for {action}: {e}");
    }
}

fn name_taken(name: &str) -> ApiError {
    ApiError::conflict(format!("Project '{name}' already exists"))
}

/// Lists projects in one workspace, or in every workspace the caller belongs to.
pub async fn list_projects(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListProjectsParams>,
) -> impl IntoResponse {
    let store = state.store.as_ref();

    let projects = match params.workspace_id.as_deref() {
        Some(workspace_id) => {
            let access = require_member(store, &auth.user, workspace_id)?;
            store
                .list_projects(&access.workspace.id)
                .api_err("Failed to list projects")?
        }
        None => {
            let mut all = Vec::new();
            for (workspace, _) in store
                .list_user_workspaces(&auth.user.id)
                .api_err("Failed to list workspaces")?
            {
                all.extend(
                    store
                        .list_projects(&workspace.id)
                        .api_err("Failed to list projects")?,
                );
            }
            all
        }
    };

    Ok::<_, ApiError>(Json(ApiResponse::success(projects)))
}

pub async fn create_project(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> impl IntoResponse {
    let store = state.store.as_ref();

    validate_project_name(&req.name)?;
    validate_description(req.description.as_deref())?;

    let access = require_member(store, &auth.user, &req.workspace_id)?;
    access
        .require_role(Role::Admin)
        .map_err(|_| ApiError::forbidden("Only ADMIN can create projects"))?;
    access.require_writable()?;

    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4().to_string(),
        workspace_id: access.workspace.id,
        name: req.name,
        description: req.description,
        created_at: now,
        updated_at: now,
    };

    match store.create_project(&project) {
        Ok(()) => {}
        Err(Error::AlreadyExists) => return Err(name_taken(&project.name)),
        Err(e) => return Err(ApiError::from_store(e, "Failed to create project")),
    }

    audit(store, "project.created", &auth.user.id, &project);

    Ok((StatusCode::CREATED, Json(ApiResponse::success(project))))
}

pub async fn get_project(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (project, _) = require_project(state.store.as_ref(), &auth.user, &id)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(project)))
}

pub async fn update_project(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let (mut project, access) = require_project(store, &auth.user, &id)?;
    access
        .require_role(Role::Mod)
        .map_err(|_| ApiError::forbidden("USER role cannot modify project settings"))?;
    access.require_writable()?;

    if let Some(name) = req.name {
        validate_project_name(&name)?;
        project.name = name;
    }
    if let Some(description) = req.description {
        validate_description(Some(&description))?;
        project.description = Some(description);
    }
    project.updated_at = Utc::now();

    match store.update_project(&project) {
        Ok(()) => {}
        Err(Error::AlreadyExists) => return Err(name_taken(&project.name)),
        Err(e) => return Err(ApiError::from_store(e, "Failed to update project")),
    }

    Ok(Json(ApiResponse::success(project)))
}

/// Deletes the project's files, releases their bytes and removes the project.
pub async fn delete_project(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let (project, access) = require_project(store, &auth.user, &id)?;
    access
        .require_role(Role::Admin)
        .map_err(|_| ApiError::forbidden("Only ADMIN can delete projects"))?;
    access.require_writable()?;

    let freed = state
        .storage
        .delete_project(&project.workspace_id, &project.id)
        .await
        .map_err(|e| {
            tracing::error!(project_id = %project.id, "Failed to delete project files: {e}");
            ApiError::internal("Failed to delete project files")
        })?;

    store
        .delete_project(&project.id, freed)
        .api_err("Failed to delete project")?;

    audit(store, "project.deleted", &auth.user.id, &project);
    tracing::info!(project_id = %project.id, freed, "Deleted project");

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
