pub const SEAT_LIMIT_MESSAGE: &str = "seat limit exceeded";

pub const SCHEMA: &str = r#"
-- Users are OAuth identities; one row per primary email, other providers are linked
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    primary_email TEXT NOT NULL UNIQUE COLLATE NOCASE,
    display_name TEXT,
    avatar_url TEXT,
    provider TEXT NOT NULL,
    provider_user_id TEXT NOT NULL,
    google_avatar_url TEXT,
    github_avatar_url TEXT,
    linked_providers TEXT NOT NULL DEFAULT '[]',  -- JSON array of provider names
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_login_at TEXT,

    UNIQUE(provider, provider_user_id)
);

-- Static subscription tiers
CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    price_cents INTEGER NOT NULL,
    storage_limit_bytes INTEGER NOT NULL CHECK (storage_limit_bytes >= 0),
    max_members INTEGER NOT NULL CHECK (max_members >= 1),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

INSERT OR IGNORE INTO plans (id, name, price_cents, storage_limit_bytes, max_members) VALUES
    ('free', 'Free', 0, 902299238, 1),
    ('haste_i', 'Haste I', 900, 10737418240, 3),
    ('haste_ii', 'Haste II', 2900, 53687091200, 10),
    ('haste_iii', 'Haste III', 7900, 214748364800, 25);

-- Tenant containers
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    plan_id TEXT NOT NULL REFERENCES plans(id),
    storage_used_bytes INTEGER NOT NULL DEFAULT 0 CHECK (storage_used_bytes >= 0),

    -- Subscription lifecycle
    cancelled_at TEXT,
    delete_after TEXT,             -- cancelled_at + 30 days
    is_read_only INTEGER NOT NULL DEFAULT 0,

    -- Billing correlation (opaque)
    stripe_customer_id TEXT,
    stripe_subscription_id TEXT UNIQUE,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One role-bound seat per (user, workspace)
CREATE TABLE IF NOT EXISTS memberships (
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('ADMIN', 'MOD', 'USER')),
    joined_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_id, workspace_id)
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    UNIQUE(workspace_id, name)
);

CREATE TABLE IF NOT EXISTS ai_usage (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    model_name TEXT,
    input_tokens INTEGER,
    output_tokens INTEGER,
    cost_cents INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Short-lived CSRF tokens for the OAuth authorization-code flow
CREATE TABLE IF NOT EXISTS oauth_states (
    state TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Audit rows outlive the user and workspace they describe
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
    workspace_id TEXT REFERENCES workspaces(id) ON DELETE SET NULL,
    action TEXT NOT NULL,
    resource_type TEXT,
    resource_id TEXT,
    details TEXT,                  -- JSON
    ip_address TEXT,
    user_agent TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Tokens are auth credentials; non-admin tokens must belong to a user
CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,        -- first 8 chars of ID for fast lookup
    is_admin INTEGER NOT NULL DEFAULT 0,
    user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,            -- NULL = never
    last_used_at TEXT
);

-- Seat limit: reject a membership once the workspace holds plan.max_members seats
CREATE TRIGGER IF NOT EXISTS enforce_seat_limit
BEFORE INSERT ON memberships
WHEN (SELECT COUNT(*) FROM memberships WHERE workspace_id = NEW.workspace_id)
     >= (SELECT p.max_members FROM workspaces w JOIN plans p ON p.id = w.plan_id
         WHERE w.id = NEW.workspace_id)
BEGIN
    SELECT RAISE(ABORT, 'seat limit exceeded');
END;

CREATE INDEX IF NOT EXISTS idx_workspaces_owner ON workspaces(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_workspaces_delete_after ON workspaces(delete_after);
CREATE INDEX IF NOT EXISTS idx_memberships_workspace ON memberships(workspace_id);
CREATE INDEX IF NOT EXISTS idx_projects_workspace ON projects(workspace_id);
CREATE INDEX IF NOT EXISTS idx_ai_usage_workspace ON ai_usage(workspace_id);
CREATE INDEX IF NOT EXISTS idx_oauth_states_expires ON oauth_states(expires_at);
CREATE INDEX IF NOT EXISTS idx_audit_log_workspace ON audit_log(workspace_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_lookup ON tokens(token_lookup);
CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
"#;
