use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{OAuthProvider, Role};

pub const FREE_PLAN_ID: &str = "free";
pub const DEFAULT_PROJECT_NAME: &str = "default";
pub const CANCELLATION_GRACE_DAYS: i64 = 30;
pub const OAUTH_STATE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub primary_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Provider the account was first created with.
    pub provider: String,
    pub provider_user_id: String,
    #[serde(skip)]
    pub google_avatar_url: Option<String>,
    #[serde(skip)]
    pub github_avatar_url: Option<String>,
    pub linked_providers: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Emails are matched without regard to case, so they are stored lowercased.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl User {
    /// Builds a new account from a first-time OAuth login.
    #[must_use]
    pub fn from_identity(identity: &OAuthIdentity, now: DateTime<Utc>) -> Self {
        let avatar_for = |provider| {
            (identity.provider == provider)
                .then(|| identity.avatar_url.clone())
                .flatten()
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            primary_email: normalize_email(&identity.email),
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            provider: identity.provider.as_str().to_string(),
            provider_user_id: identity.provider_user_id.clone(),
            google_avatar_url: avatar_for(OAuthProvider::Google),
            github_avatar_url: avatar_for(OAuthProvider::GitHub),
            linked_providers: vec![identity.provider.as_str().to_string()],
            created_at: now,
            last_login_at: Some(now),
        }
    }

    /// Records a login through `identity` on an existing account with the same email,
    /// linking the provider if needed.
    pub fn record_login(&mut self, identity: &OAuthIdentity, now: DateTime<Utc>) {
        self.last_login_at = Some(now);

        let provider = identity.provider.as_str();
        if self.linked_providers.is_empty() {
            self.linked_providers.push(self.provider.clone());
        }
        if !self.linked_providers.iter().any(|p| p == provider) {
            self.linked_providers.push(provider.to_string());
        }

        if let Some(avatar) = identity.avatar_url.clone() {
            match identity.provider {
                OAuthProvider::Google => self.google_avatar_url = Some(avatar.clone()),
                OAuthProvider::GitHub => self.github_avatar_url = Some(avatar.clone()),
            }
            if self.provider == provider {
                self.avatar_url = Some(avatar);
            }
        }

        if self.display_name.as_deref().is_none_or(str::is_empty) {
            if let Some(name) = identity.display_name.clone() {
                self.display_name = Some(name);
            }
        }

        // Google avatar wins whenever Google is linked
        let google_linked = self
            .linked_providers
            .iter()
            .any(|p| p == OAuthProvider::Google.as_str());
        if google_linked && self.google_avatar_url.is_some() {
            self.avatar_url = self.google_avatar_url.clone();
        }
    }
}

/// Identity returned by an OAuth provider after a successful code exchange.
#[derive(Debug, Clone)]
pub struct OAuthIdentity {
    pub provider: OAuthProvider,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub storage_limit_bytes: i64,
    pub max_members: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub owner_user_id: String,
    pub plan_id: String,
    pub storage_used_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<DateTime<Utc>>,
    pub is_read_only: bool,
    #[serde(skip)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip)]
    pub stripe_subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Deletion deadline for a workspace cancelled at `cancelled_at`.
    #[must_use]
    pub fn deletion_deadline(cancelled_at: DateTime<Utc>) -> DateTime<Utc> {
        cancelled_at + Duration::days(CANCELLATION_GRACE_DAYS)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// A workspace becomes eligible for purge at exactly `delete_after`.
    #[must_use]
    pub fn is_purge_due(&self, now: DateTime<Utc>) -> bool {
        self.delete_after.is_some_and(|deadline| deadline <= now)
    }

    /// Cancelled workspaces stay exportable until their deletion deadline.
    #[must_use]
    pub fn can_export(&self, now: DateTime<Utc>) -> bool {
        match (self.cancelled_at, self.delete_after) {
            (None, _) => true,
            (Some(_), Some(deadline)) => now <= deadline,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: String,
    pub workspace_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// A membership joined with the member's profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything created for a brand-new user in one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub user: User,
    pub workspace: Workspace,
    pub project: Project,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub provider: OAuthProvider,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthState {
    #[must_use]
    pub fn new(state: String, provider: OAuthProvider, now: DateTime<Utc>) -> Self {
        Self {
            state,
            provider,
            created_at: now,
            expires_at: now + Duration::minutes(OAUTH_STATE_TTL_MINUTES),
        }
    }
}

/// Result of redeeming an OAuth state. Any state that was found is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRedemption {
    Valid,
    Unknown,
    Expired,
    ProviderMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiUsage {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl AiUsage {
    /// Largest token count accepted for a single request, per direction.
    pub const MAX_TOKENS: i64 = 100_000_000;

    /// Estimated cost in cents, floored. Metered providers bill per million tokens;
    /// local providers are free. Without both token counts there is no estimate.
    #[must_use]
    pub fn estimate_cost_cents(
        provider: &str,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
    ) -> Option<i64> {
        let (Some(input), Some(output)) = (input_tokens, output_tokens) else {
            return None;
        };
        if input <= 0 || output <= 0 {
            return None;
        }
        match provider {
            // 0.075 USD in / 0.30 USD out per million tokens
            "gemini" => {
                let cents = (i128::from(input) * 75 + i128::from(output) * 300) / 10_000_000;
                Some(i64::try_from(cents).unwrap_or(i64::MAX))
            }
            _ => Some(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiUsageSummary {
    pub total_requests: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(action: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            workspace_id: None,
            action: action.to_string(),
            resource_type: None,
            resource_id: None,
            details: None,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn by_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn in_workspace(mut self, workspace_id: &str) -> Self {
        self.workspace_id = Some(workspace_id.to_string());
        self
    }

    #[must_use]
    pub fn resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCount {
    pub plan: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_users: i64,
    pub total_workspaces: i64,
    pub cancelled_workspaces: i64,
    pub total_projects: i64,
    pub total_storage_bytes: i64,
    pub workspaces_by_plan: Vec<PlanCount>,
}
