use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Plan, Role, Token, User, Workspace};

#[derive(Debug, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionUserRequest {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Defaults to `google`.
    #[serde(default)]
    pub provider: Option<String>,
    /// Defaults to the email address.
    #[serde(default)]
    pub provider_user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateUserTokenRequest {
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub metadata: Token,
}

#[derive(Debug, Serialize)]
pub struct DeleteUserResponse {
    pub user_id: String,
    pub deleted_workspaces: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceResponse {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub plan: Plan,
    pub my_role: Role,
    pub member_count: i64,
    pub project_count: i64,
    pub can_export: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    #[serde(default = "default_member_role")]
    pub role: String,
}

fn default_member_role() -> String {
    Role::User.as_str().to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListProjectsParams {
    #[serde(default)]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilesParams {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileWriteResponse {
    pub path: String,
    pub size_bytes: i64,
    pub storage_used_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct FileDeleteResponse {
    pub path: String,
    pub freed_bytes: i64,
    pub storage_used_bytes: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecordAiUsageRequest {
    pub provider: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogParams {
    #[serde(default)]
    pub limit: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Set by the provider when the user denies consent.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub workspaces: Vec<MyWorkspace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct MyWorkspace {
    pub id: String,
    pub plan_id: String,
    pub role: Role,
    pub is_owner: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}
