use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;

use crate::auth::RequireUser;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{AddMemberRequest, UpdateMemberRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::parse_role;
use crate::store::Store;
use crate::types::{AuditEntry, Membership, Role};

use super::access::require_member;

fn audit(
    store: &dyn Store,
    action: &str,
    actor: &str,
    workspace_id: &str,
    member: &str,
    role: Option<Role>,
) {
    let mut entry = AuditEntry::new(action)
        .by_user(actor)
        .in_workspace(workspace_id)
        .resource("user", member);
    if let Some(role) = role {
        entry = entry.details(json!({ "role": role }));
    }
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for {action}: {e}");
    }
}

pub async fn list_members(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;

    let members = store
        .list_members(&access.workspace.id)
        .api_err("Failed to list members")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(members)))
}

/// Invites an existing user by email. Rejected once the plan's seats are taken.
pub async fn add_member(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;
    access
        .require_role(Role::Admin)
        .map_err(|_| ApiError::forbidden("Only ADMIN can add members"))?;

    let role = parse_role(&req.role)?;
    let email = req.email.trim().to_lowercase();

    let invitee = store
        .get_user_by_email(&email)
        .api_err("Failed to look up user")?
        .ok_or_else(|| ApiError::not_found(format!("User not found with email: {email}")))?;

    let membership = Membership {
        user_id: invitee.id.clone(),
        workspace_id: access.workspace.id.clone(),
        role,
        joined_at: Utc::now(),
    };

    match store.add_member(&membership) {
        Ok(()) => {}
        Err(Error::AlreadyExists) => {
            return Err(ApiError::conflict(
                "User is already a member of this workspace",
            ));
        }
        Err(e) => return Err(ApiError::from_store(e, "Failed to add member")),
    }

    audit(
        store,
        "member.added",
        &auth.user.id,
        &access.workspace.id,
        &invitee.id,
        Some(role),
    );

    Ok((StatusCode::CREATED, Json(ApiResponse::success(membership))))
}

pub async fn update_member(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
    Json(req): Json<UpdateMemberRequest>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;
    access
        .require_role(Role::Admin)
        .map_err(|_| ApiError::forbidden("Only ADMIN can change member roles"))?;

    let role = parse_role(&req.role)?;

    if access.is_owner(&user_id) && role != Role::Admin {
        return Err(ApiError::forbidden("Cannot demote workspace owner"));
    }

    store
        .update_member_role(&user_id, &access.workspace.id, role)
        .map_err(|e| match e {
            Error::NotFound => ApiError::not_found("Member not found in this workspace"),
            e => ApiError::from_store(e, "Failed to update member"),
        })?;

    let membership = store
        .get_membership(&user_id, &access.workspace.id)
        .api_err("Failed to get membership")?
        .or_not_found("Member not found in this workspace")?;

    audit(
        store,
        "member.role_changed",
        &auth.user.id,
        &access.workspace.id,
        &user_id,
        Some(role),
    );

    Ok(Json(ApiResponse::success(membership)))
}

pub async fn remove_member(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;
    access
        .require_role(Role::Admin)
        .map_err(|_| ApiError::forbidden("Only ADMIN can remove members"))?;

    if access.is_owner(&user_id) {
        return Err(ApiError::forbidden("Cannot remove workspace owner"));
    }

    let removed = store
        .remove_member(&user_id, &access.workspace.id)
        .api_err("Failed to remove member")?;
    if !removed {
        return Err(ApiError::not_found("Member not found in this workspace"));
    }

    audit(
        store,
        "member.removed",
        &auth.user.id,
        &access.workspace.id,
        &user_id,
        None,
    );

    Ok(StatusCode::NO_CONTENT)
}
