use chrono::Utc;

use crate::server::response::{ApiError, StoreOptionExt, StoreResultExt};
use crate::store::Store;
use crate::types::{Project, Role, User, Workspace};

/// A workspace together with the caller's role in it.
pub struct WorkspaceAccess {
    pub workspace: Workspace,
    pub role: Role,
}

impl WorkspaceAccess {
    /// Returns forbidden unless the caller holds at least `required`.
    pub fn require_role(&self, required: Role) -> Result<(), ApiError> {
        if !self.role.at_least(required) {
            return Err(ApiError::forbidden(format!("Requires {required} role")));
        }
        Ok(())
    }

    /// Returns forbidden if the workspace subscription was cancelled.
    pub fn require_writable(&self) -> Result<(), ApiError> {
        if self.workspace.is_read_only {
            return Err(ApiError::forbidden(
                "Workspace is in read-only mode (cancelled subscription)",
            ));
        }
        Ok(())
    }

    /// Cancelled workspaces stay readable until their deletion deadline.
    pub fn require_readable(&self) -> Result<(), ApiError> {
        if !self.workspace.can_export(Utc::now()) {
            return Err(ApiError::forbidden("Export grace period has expired"));
        }
        Ok(())
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.workspace.owner_user_id == user_id
    }
}

/// Loads a workspace the user belongs to.
pub fn require_member(
    store: &dyn Store,
    user: &User,
    workspace_id: &str,
) -> Result<WorkspaceAccess, ApiError> {
    let workspace = store
        .get_workspace(workspace_id)
        .api_err("Failed to get workspace")?
        .or_not_found("Workspace not found")?;

    let membership = store
        .get_membership(&user.id, &workspace.id)
        .api_err("Failed to check membership")?
        .ok_or_else(|| ApiError::forbidden("You are not a member of this workspace"))?;

    Ok(WorkspaceAccess {
        workspace,
        role: membership.role,
    })
}

/// Loads a project and the user's access to its workspace.
pub fn require_project(
    store: &dyn Store,
    user: &User,
    project_id: &str,
) -> Result<(Project, WorkspaceAccess), ApiError> {
    let project = store
        .get_project(project_id)
        .api_err("Failed to get project")?
        .or_not_found("Project not found")?;

    let access = require_member(store, user, &project.workspace_id).map_err(|e| {
        if e.status == axum::http::StatusCode::FORBIDDEN {
            ApiError::forbidden("You do not have access to this project")
        } else {
            e
        }
    })?;

    Ok((project, access))
}
