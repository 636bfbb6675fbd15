pub mod access;
mod ai_usage;
mod audit;
mod files;
mod members;
mod plans;
mod projects;
mod workspaces;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post, put},
};

use crate::server::AppState;

/// Largest accepted file upload.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

pub fn user_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/plans", get(plans::list_plans))
        // Workspaces
        .route("/workspaces", get(workspaces::list_workspaces))
        .route("/workspaces/{id}", get(workspaces::get_workspace))
        .route("/workspaces/{id}/export", post(workspaces::export_workspace))
        .route("/workspaces/{id}/members", get(members::list_members))
        .route("/workspaces/{id}/members", post(members::add_member))
        .route(
            "/workspaces/{id}/members/{user_id}",
            patch(members::update_member),
        )
        .route(
            "/workspaces/{id}/members/{user_id}",
            delete(members::remove_member),
        )
        .route("/workspaces/{id}/ai-usage", get(ai_usage::get_summary))
        .route("/workspaces/{id}/ai-usage", post(ai_usage::record_usage))
        .route("/workspaces/{id}/audit-log", get(audit::list_audit_log))
        // Projects
        .route("/projects", get(projects::list_projects))
        .route("/projects", post(projects::create_project))
        .route("/projects/{id}", get(projects::get_project))
        .route("/projects/{id}", patch(projects::update_project))
        .route("/projects/{id}", delete(projects::delete_project))
        // Files
        .route("/projects/{id}/files", get(files::list_files))
        .route(
            "/projects/{id}/files/{*path}",
            put(files::upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/projects/{id}/files/{*path}", get(files::download_file))
        .route("/projects/{id}/files/{*path}", delete(files::delete_file))
}
