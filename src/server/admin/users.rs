use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use serde_json::json;

use crate::auth::{RequireAdmin, TokenGenerator};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{
    CreateTokenResponse, CreateUserTokenRequest, DeleteUserResponse, PaginationParams,
    ProvisionUserRequest,
};
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, StoreOptionExt, StoreResultExt,
    paginate,
};
use crate::server::validation::validate_email;
use crate::store::Store;
use crate::types::{AuditEntry, OAuthIdentity, OAuthProvider, User};

fn load_user(store: &dyn Store, id: &str) -> Result<User, ApiError> {
    store
        .get_user(id)
        .api_err("Failed to get user")?
        .or_not_found("User not found")
}

pub async fn provision_user(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionUserRequest>,
) -> impl IntoResponse {
    let email = req.email.trim().to_lowercase();
    validate_email(&email)?;

    let provider = match req.provider.as_deref() {
        Some(name) => OAuthProvider::parse(name)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown provider: {name}")))?,
        None => OAuthProvider::Google,
    };

    let identity = OAuthIdentity {
        provider,
        provider_user_id: req.provider_user_id.unwrap_or_else(|| email.clone()),
        email,
        display_name: req.display_name,
        avatar_url: None,
    };
    let mut user = User::from_identity(&identity, Utc::now());
    user.last_login_at = None;

    let provisioned = match state.store.provision_user(&user) {
        Ok(provisioned) => provisioned,
        Err(Error::AlreadyExists) => return Err(ApiError::conflict("User already exists")),
        Err(e) => return Err(ApiError::from_store(e, "Failed to provision user")),
    };

    let entry = AuditEntry::new("user.provisioned")
        .by_user(&provisioned.user.id)
        .in_workspace(&provisioned.workspace.id)
        .resource("user", &provisioned.user.id)
        .details(json!({ "source": "admin" }));
    if let Err(e) = state.store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for user.provisioned: {e}");
    }

    Ok((StatusCode::CREATED, Json(ApiResponse::success(provisioned))))
}

pub async fn list_users(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let cursor = params.cursor.as_deref().unwrap_or("");

    let users = state
        .store
        .list_users(cursor, DEFAULT_PAGE_SIZE + 1)
        .api_err("Failed to list users")?;

    let (users, next_cursor, has_more) =
        paginate(users, DEFAULT_PAGE_SIZE as usize, |u| u.id.clone());

    Ok::<_, ApiError>(Json(PaginatedResponse::new(users, next_cursor, has_more)))
}

pub async fn get_user(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let user = load_user(state.store.as_ref(), &id)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(user)))
}

/// Deletes the user and every workspace they own, including the files.
pub async fn delete_user(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let user = load_user(store, &id)?;

    let owned: Vec<String> = store
        .list_owned_workspaces(&user.id)
        .api_err("Failed to list owned workspaces")?
        .into_iter()
        .map(|w| w.id)
        .collect();

    store
        .delete_user(&user.id)
        .api_err("Failed to delete user")?;

    // Leftover trees are swept by the purge job
    for workspace_id in &owned {
        if let Err(e) = state.storage.delete_workspace(workspace_id).await {
            tracing::warn!(workspace_id = %workspace_id, "Failed to delete workspace files: {e}");
        }
    }

    let entry = AuditEntry::new("user.deleted")
        .resource("user", &user.id)
        .details(json!({ "email": user.primary_email, "workspaces": owned }));
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for user.deleted: {e}");
    }

    tracing::info!(user_id = %user.id, "Deleted user and {} workspaces", owned.len());

    Ok::<_, ApiError>(Json(ApiResponse::success(DeleteUserResponse {
        user_id: user.id,
        deleted_workspaces: owned,
    })))
}

pub async fn list_user_tokens(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let user = load_user(state.store.as_ref(), &id)?;

    let tokens = state
        .store
        .list_user_tokens(&user.id)
        .api_err("Failed to list user tokens")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(tokens)))
}

pub async fn create_user_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateUserTokenRequest>,
) -> impl IntoResponse {
    let user = load_user(state.store.as_ref(), &id)?;

    if let Some(seconds) = req.expires_in_seconds {
        if seconds < 0 {
            return Err(ApiError::bad_request(
                "expires_in_seconds cannot be negative",
            ));
        }
    }

    let expires_at = req
        .expires_in_seconds
        .map(|s| Utc::now() + Duration::seconds(s));

    let (raw_token, token) = TokenGenerator::new()
        .issue(state.store.as_ref(), false, Some(&user.id), expires_at)
        .api_err("Failed to create token")?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateTokenResponse {
            token: raw_token,
            metadata: token,
        })),
    ))
}
