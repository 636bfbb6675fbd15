mod jobs;
mod stats;
mod tokens;
mod users;
mod workspaces;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(stats::get_stats))
        // User routes
        .route("/users", post(users::provision_user))
        .route("/users", get(users::list_users))
        .route("/users/{id}", get(users::get_user))
        .route("/users/{id}", delete(users::delete_user))
        .route("/users/{id}/tokens", get(users::list_user_tokens))
        .route("/users/{id}/tokens", post(users::create_user_token))
        // Token routes
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/{id}", get(tokens::get_token))
        .route("/tokens/{id}", delete(tokens::delete_token))
        // Workspace lifecycle
        .route("/workspaces/{id}", get(workspaces::get_workspace))
        .route("/workspaces/{id}/cancel", post(workspaces::cancel_workspace))
        .route(
            "/workspaces/{id}/reactivate",
            post(workspaces::reactivate_workspace),
        )
}

/// Scheduler endpoints, called periodically with an admin token.
pub fn jobs_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/storage-reconciliation", post(jobs::storage_reconciliation))
        .route("/purge-deleted-workspaces", post(jobs::purge_deleted_workspaces))
        .route(
            "/cleanup-expired-oauth-states",
            post(jobs::cleanup_expired_oauth_states),
        )
}
