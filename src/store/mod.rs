pub mod path;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Store defines the database interface.
///
/// Every operation that enforces a business rule (seat limit, storage quota,
/// read-only workspaces, single-use OAuth state) runs in one write transaction.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User operations
    /// Creates the user together with a free workspace, an ADMIN membership and a
    /// default project. Nothing is written if any step fails.
    fn provision_user(&self, user: &User) -> Result<Provisioned>;
    /// Logs in an OAuth identity, linking by email. Returns the user and whether it
    /// was newly provisioned.
    fn upsert_oauth_user(&self, identity: &OAuthIdentity, now: DateTime<Utc>)
    -> Result<(User, bool)>;
    fn get_user(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn list_users(&self, cursor: &str, limit: i32) -> Result<Vec<User>>;
    fn delete_user(&self, id: &str) -> Result<bool>;

    // Plan operations
    fn list_plans(&self) -> Result<Vec<Plan>>;
    fn get_plan(&self, id: &str) -> Result<Option<Plan>>;

    // Workspace operations
    fn get_workspace(&self, id: &str) -> Result<Option<Workspace>>;
    fn get_workspace_by_subscription(&self, subscription_id: &str) -> Result<Option<Workspace>>;
    fn list_workspaces(&self) -> Result<Vec<Workspace>>;
    fn list_owned_workspaces(&self, user_id: &str) -> Result<Vec<Workspace>>;
    fn list_user_workspaces(&self, user_id: &str) -> Result<Vec<(Workspace, Role)>>;
    fn count_members(&self, workspace_id: &str) -> Result<i64>;
    fn count_projects(&self, workspace_id: &str) -> Result<i64>;

    // Subscription lifecycle
    fn activate_subscription(
        &self,
        workspace_id: &str,
        plan_id: &str,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Workspace>;
    /// Marks the workspace cancelled and read-only. Re-cancelling keeps the original
    /// deletion clock.
    fn cancel_workspace(&self, workspace_id: &str, now: DateTime<Utc>) -> Result<Workspace>;
    fn reactivate_workspace(&self, workspace_id: &str) -> Result<Workspace>;
    fn list_purge_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Workspace>>;
    /// Deletes a workspace whose deadline has passed and writes `audit` in the same
    /// transaction. Returns false if the workspace is gone or no longer due.
    fn purge_workspace(
        &self,
        workspace_id: &str,
        now: DateTime<Utc>,
        audit: &AuditEntry,
    ) -> Result<bool>;

    // Storage accounting
    /// Applies `delta` to the workspace counter. Rejects read-only workspaces and
    /// growth beyond the plan quota; decrements clamp at zero. Returns the new usage.
    fn adjust_storage(&self, workspace_id: &str, delta: i64) -> Result<i64>;
    /// Decrements the counter without read-only or quota checks.
    fn release_storage(&self, workspace_id: &str, bytes: i64) -> Result<i64>;
    /// Overwrites the counter. Returns the previous value when it differed.
    fn set_storage_used(&self, workspace_id: &str, bytes: i64) -> Result<Option<i64>>;

    // Membership operations
    fn add_member(&self, membership: &Membership) -> Result<()>;
    fn get_membership(&self, user_id: &str, workspace_id: &str) -> Result<Option<Membership>>;
    fn list_members(&self, workspace_id: &str) -> Result<Vec<Member>>;
    fn update_member_role(&self, user_id: &str, workspace_id: &str, role: Role) -> Result<()>;
    fn remove_member(&self, user_id: &str, workspace_id: &str) -> Result<bool>;

    // Project operations
    fn create_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: &str) -> Result<Option<Project>>;
    fn list_projects(&self, workspace_id: &str) -> Result<Vec<Project>>;
    fn update_project(&self, project: &Project) -> Result<()>;
    /// Deletes the project row and releases `freed_bytes` from its workspace.
    fn delete_project(&self, id: &str, freed_bytes: i64) -> Result<bool>;

    // Token operations
    fn create_token(&self, token: &Token) -> Result<()>;
    fn get_token_by_id(&self, id: &str) -> Result<Option<Token>>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>>;
    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>>;
    fn list_user_tokens(&self, user_id: &str) -> Result<Vec<Token>>;
    fn delete_token(&self, id: &str) -> Result<bool>;
    fn update_token_last_used(&self, id: &str) -> Result<()>;
    fn has_admin_token(&self) -> Result<bool>;

    // OAuth state operations
    fn create_oauth_state(&self, state: &OAuthState) -> Result<()>;
    /// Consumes a state. Any state that exists is deleted, valid or not.
    fn redeem_oauth_state(
        &self,
        state: &str,
        provider: OAuthProvider,
        now: DateTime<Utc>,
    ) -> Result<StateRedemption>;
    fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize>;

    // AI usage
    fn record_ai_usage(&self, usage: &AiUsage) -> Result<()>;
    fn ai_usage_summary(&self, workspace_id: &str) -> Result<AiUsageSummary>;

    // Audit log
    fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()>;
    fn list_audit_entries(&self, workspace_id: &str, limit: i32) -> Result<Vec<AuditEntry>>;

    fn stats(&self) -> Result<SystemStats>;
}
