use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::Store;
use super::schema::{SCHEMA, SEAT_LIMIT_MESSAGE};
use crate::error::{Error, Result};
use crate::types::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const USER_COLUMNS: &str = "id, primary_email, display_name, avatar_url, provider, provider_user_id, \
     google_avatar_url, github_avatar_url, linked_providers, created_at, last_login_at";

const WORKSPACE_COLUMNS: &str = "w.id, w.owner_user_id, w.plan_id, w.storage_used_bytes, w.cancelled_at, \
     w.delete_after, w.is_read_only, w.stripe_customer_id, w.stripe_subscription_id, \
     w.created_at, w.updated_at";

const PROJECT_COLUMNS: &str = "id, workspace_id, name, description, created_at, updated_at";

const TOKEN_COLUMNS: &str =
    "id, token_hash, token_lookup, is_admin, user_id, created_at, expires_at, last_used_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_user_by_provider(
        &self,
        provider: OAuthProvider,
        provider_user_id: &str,
    ) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {USER_COLUMNS} FROM users WHERE provider = ?1 AND provider_user_id = ?2"
            ),
            params![provider.as_str(), provider_user_id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn update_login(&self, user: &User) -> Result<()> {
        let linked = serde_json::to_string(&user.linked_providers)?;
        self.conn().execute(
            "UPDATE users SET display_name = ?1, avatar_url = ?2, google_avatar_url = ?3,
                 github_avatar_url = ?4, linked_providers = ?5, last_login_at = ?6
             WHERE id = ?7",
            params![
                user.display_name,
                user.avatar_url,
                user.google_avatar_url,
                user.github_avatar_url,
                linked,
                user.last_login_at.as_ref().map(format_datetime),
                user.id,
            ],
        )?;
        Ok(())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps so that SQL string comparison orders them correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_role(s: &str) -> Role {
    Role::parse(s).unwrap_or_else(|| {
        tracing::error!("Invalid role in database: '{}'", s);
        Role::User
    })
}

fn opt_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .map(|s| parse_datetime(&s)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let linked: String = row.get(8)?;
    Ok(User {
        id: row.get(0)?,
        primary_email: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        provider: row.get(4)?,
        provider_user_id: row.get(5)?,
        google_avatar_url: row.get(6)?,
        github_avatar_url: row.get(7)?,
        linked_providers: serde_json::from_str(&linked).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        last_login_at: opt_datetime(row, 10)?,
    })
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        plan_id: row.get(2)?,
        storage_used_bytes: row.get(3)?,
        cancelled_at: opt_datetime(row, 4)?,
        delete_after: opt_datetime(row, 5)?,
        is_read_only: row.get(6)?,
        stripe_customer_id: row.get(7)?,
        stripe_subscription_id: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        token_lookup: row.get(2)?,
        is_admin: row.get(3)?,
        user_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        expires_at: opt_datetime(row, 6)?,
        last_used_at: opt_datetime(row, 7)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let details: Option<String> = row.get(6)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        workspace_id: row.get(2)?,
        action: row.get(3)?,
        resource_type: row.get(4)?,
        resource_id: row.get(5)?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        ip_address: row.get(7)?,
        user_agent: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Maps unique-constraint failures to `AlreadyExists`.
fn unique_error(e: rusqlite::Error) -> Error {
    if is_constraint_violation(&e) {
        Error::AlreadyExists
    } else {
        Error::from(e)
    }
}

/// Maps the seat-limit trigger abort to `SeatLimitExceeded`.
fn membership_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains(SEAT_LIMIT_MESSAGE) => {
            Error::SeatLimitExceeded
        }
        _ => unique_error(e),
    }
}

fn fetch_workspace(conn: &Connection, id: &str) -> rusqlite::Result<Option<Workspace>> {
    conn.query_row(
        &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces w WHERE w.id = ?1"),
        params![id],
        workspace_from_row,
    )
    .optional()
}

fn insert_user(conn: &Connection, user: &User) -> Result<()> {
    let linked = serde_json::to_string(&user.linked_providers)?;
    conn.execute(
        "INSERT INTO users (id, primary_email, display_name, avatar_url, provider, provider_user_id,
             google_avatar_url, github_avatar_url, linked_providers, created_at, last_login_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            user.id,
            user.primary_email,
            user.display_name,
            user.avatar_url,
            user.provider,
            user.provider_user_id,
            user.google_avatar_url,
            user.github_avatar_url,
            linked,
            format_datetime(&user.created_at),
            user.last_login_at.as_ref().map(format_datetime),
        ],
    )
    .map_err(unique_error)?;
    Ok(())
}

fn insert_membership(conn: &Connection, membership: &Membership) -> Result<()> {
    conn.execute(
        "INSERT INTO memberships (user_id, workspace_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            membership.user_id,
            membership.workspace_id,
            membership.role.as_str(),
            format_datetime(&membership.joined_at),
        ],
    )
    .map_err(membership_error)?;
    Ok(())
}

fn insert_project(conn: &Connection, project: &Project) -> Result<()> {
    conn.execute(
        "INSERT INTO projects (id, workspace_id, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            project.id,
            project.workspace_id,
            project.name,
            project.description,
            format_datetime(&project.created_at),
            format_datetime(&project.updated_at),
        ],
    )
    .map_err(unique_error)?;
    Ok(())
}

fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    let details = entry
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO audit_log (id, user_id, workspace_id, action, resource_type, resource_id,
             details, ip_address, user_agent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id,
            entry.user_id,
            entry.workspace_id,
            entry.action,
            entry.resource_type,
            entry.resource_id,
            details,
            entry.ip_address,
            entry.user_agent,
            format_datetime(&entry.created_at),
        ],
    )?;
    Ok(())
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // User operations

    fn provision_user(&self, user: &User) -> Result<Provisioned> {
        let now = Utc::now();
        let workspace = Workspace {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: user.id.clone(),
            plan_id: FREE_PLAN_ID.to_string(),
            storage_used_bytes: 0,
            cancelled_at: None,
            delete_after: None,
            is_read_only: false,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: now,
            updated_at: now,
        };
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace.id.clone(),
            name: DEFAULT_PROJECT_NAME.to_string(),
            description: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        insert_user(&tx, user)?;
        tx.execute(
            "INSERT INTO workspaces (id, owner_user_id, plan_id, storage_used_bytes, is_read_only,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
            params![
                workspace.id,
                workspace.owner_user_id,
                workspace.plan_id,
                format_datetime(&workspace.created_at),
                format_datetime(&workspace.updated_at),
            ],
        )?;
        insert_membership(
            &tx,
            &Membership {
                user_id: user.id.clone(),
                workspace_id: workspace.id.clone(),
                role: Role::Admin,
                joined_at: now,
            },
        )?;
        insert_project(&tx, &project)?;

        tx.commit()?;

        Ok(Provisioned {
            user: user.clone(),
            workspace,
            project,
        })
    }

    fn upsert_oauth_user(
        &self,
        identity: &OAuthIdentity,
        now: DateTime<Utc>,
    ) -> Result<(User, bool)> {
        if let Some(mut user) = self.get_user_by_email(&identity.email)? {
            user.record_login(identity, now);
            self.update_login(&user)?;
            return Ok((user, false));
        }

        let user = User::from_identity(identity, now);
        match self.provision_user(&user) {
            Ok(provisioned) => Ok((provisioned.user, true)),
            Err(Error::AlreadyExists) => {
                // Lost a creation race, or the provider account is registered under
                // a different email.
                let existing = match self.get_user_by_email(&identity.email)? {
                    Some(user) => Some(user),
                    None => {
                        self.get_user_by_provider(identity.provider, &identity.provider_user_id)?
                    }
                };
                let mut existing = existing.ok_or(Error::AlreadyExists)?;
                existing.record_login(identity, now);
                self.update_login(&existing)?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE primary_email = ?1 COLLATE NOCASE"),
            params![email.trim()],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_users(&self, cursor: &str, limit: i32) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![cursor, limit], user_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_user(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Plan operations

    fn list_plans(&self) -> Result<Vec<Plan>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, price_cents, storage_limit_bytes, max_members
             FROM plans ORDER BY price_cents, id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Plan {
                id: row.get(0)?,
                name: row.get(1)?,
                price_cents: row.get(2)?,
                storage_limit_bytes: row.get(3)?,
                max_members: row.get(4)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, price_cents, storage_limit_bytes, max_members
             FROM plans WHERE id = ?1",
            params![id],
            |row| {
                Ok(Plan {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price_cents: row.get(2)?,
                    storage_limit_bytes: row.get(3)?,
                    max_members: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // Workspace operations

    fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn();
        fetch_workspace(&conn, id).map_err(Error::from)
    }

    fn get_workspace_by_subscription(&self, subscription_id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {WORKSPACE_COLUMNS} FROM workspaces w WHERE w.stripe_subscription_id = ?1"
            ),
            params![subscription_id],
            workspace_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces w ORDER BY w.id"
        ))?;

        let rows = stmt.query_map([], workspace_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_owned_workspaces(&self, user_id: &str) -> Result<Vec<Workspace>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces w WHERE w.owner_user_id = ?1 ORDER BY w.created_at"
        ))?;

        let rows = stmt.query_map(params![user_id], workspace_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_user_workspaces(&self, user_id: &str) -> Result<Vec<(Workspace, Role)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS}, m.role
             FROM workspaces w
             JOIN memberships m ON m.workspace_id = w.id
             WHERE m.user_id = ?1
             ORDER BY w.created_at"
        ))?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                workspace_from_row(row)?,
                parse_role(&row.get::<_, String>(11)?),
            ))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn count_members(&self, workspace_id: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM memberships WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn count_projects(&self, workspace_id: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // Subscription lifecycle

    fn activate_subscription(
        &self,
        workspace_id: &str,
        plan_id: &str,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Workspace> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let max_members: i64 = tx
            .query_row(
                "SELECT max_members FROM plans WHERE id = ?1",
                params![plan_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::BadRequest(format!("unknown plan '{plan_id}'")))?;

        if fetch_workspace(&tx, workspace_id)?.is_none() {
            return Err(Error::NotFound);
        }

        // A plan change must not leave more members than the new plan allows
        let members: i64 = tx.query_row(
            "SELECT COUNT(*) FROM memberships WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        if members > max_members {
            return Err(Error::SeatLimitExceeded);
        }

        let rows = tx
            .execute(
                "UPDATE workspaces SET
                     plan_id = ?1,
                     stripe_customer_id = COALESCE(?2, stripe_customer_id),
                     stripe_subscription_id = COALESCE(?3, stripe_subscription_id),
                     cancelled_at = NULL,
                     delete_after = NULL,
                     is_read_only = 0,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    plan_id,
                    customer_id,
                    subscription_id,
                    format_datetime(&Utc::now()),
                    workspace_id,
                ],
            )
            .map_err(unique_error)?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        let workspace = fetch_workspace(&tx, workspace_id)?.ok_or(Error::NotFound)?;
        tx.commit()?;
        Ok(workspace)
    }

    fn cancel_workspace(&self, workspace_id: &str, now: DateTime<Utc>) -> Result<Workspace> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = tx.execute(
            "UPDATE workspaces SET
                 cancelled_at = COALESCE(cancelled_at, ?1),
                 delete_after = COALESCE(delete_after, ?2),
                 is_read_only = 1,
                 updated_at = ?1
             WHERE id = ?3",
            params![
                format_datetime(&now),
                format_datetime(&Workspace::deletion_deadline(now)),
                workspace_id,
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        let workspace = fetch_workspace(&tx, workspace_id)?.ok_or(Error::NotFound)?;
        tx.commit()?;
        Ok(workspace)
    }

    fn reactivate_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = tx.execute(
            "UPDATE workspaces SET cancelled_at = NULL, delete_after = NULL, is_read_only = 0,
                 updated_at = ?1
             WHERE id = ?2",
            params![format_datetime(&Utc::now()), workspace_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        let workspace = fetch_workspace(&tx, workspace_id)?.ok_or(Error::NotFound)?;
        tx.commit()?;
        Ok(workspace)
    }

    fn list_purge_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Workspace>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces w
             WHERE w.delete_after IS NOT NULL AND w.delete_after <= ?1
             ORDER BY w.delete_after"
        ))?;

        let rows = stmt.query_map(params![format_datetime(&now)], workspace_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn purge_workspace(
        &self,
        workspace_id: &str,
        now: DateTime<Utc>,
        audit: &AuditEntry,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The audit row must exist before the delete so its workspace reference is
        // nulled by the cascade instead of failing the foreign key.
        insert_audit(&tx, audit)?;

        let rows = tx.execute(
            "DELETE FROM workspaces
             WHERE id = ?1 AND delete_after IS NOT NULL AND delete_after <= ?2",
            params![workspace_id, format_datetime(&now)],
        )?;
        if rows == 0 {
            // Reactivated or already purged; dropping the transaction discards the audit row
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    // Storage accounting

    fn adjust_storage(&self, workspace_id: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (used, read_only, limit): (i64, bool, i64) = tx
            .query_row(
                "SELECT w.storage_used_bytes, w.is_read_only, p.storage_limit_bytes
                 FROM workspaces w JOIN plans p ON p.id = w.plan_id
                 WHERE w.id = ?1",
                params![workspace_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        if read_only {
            return Err(Error::ReadOnly);
        }

        let requested = used.saturating_add(delta);
        if delta > 0 && requested > limit {
            return Err(Error::QuotaExceeded {
                used: requested,
                limit,
            });
        }
        let new_used = requested.max(0);

        tx.execute(
            "UPDATE workspaces SET storage_used_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_used, format_datetime(&Utc::now()), workspace_id],
        )?;
        tx.commit()?;
        Ok(new_used)
    }

    fn release_storage(&self, workspace_id: &str, bytes: i64) -> Result<i64> {
        let conn = self.conn();
        conn.query_row(
            "UPDATE workspaces SET storage_used_bytes = MAX(0, storage_used_bytes - ?1)
             WHERE id = ?2
             RETURNING storage_used_bytes",
            params![bytes.max(0), workspace_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::NotFound)
    }

    fn set_storage_used(&self, workspace_id: &str, bytes: i64) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: i64 = tx
            .query_row(
                "SELECT storage_used_bytes FROM workspaces WHERE id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        let bytes = bytes.max(0);
        if previous == bytes {
            return Ok(None);
        }

        tx.execute(
            "UPDATE workspaces SET storage_used_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            params![bytes, format_datetime(&Utc::now()), workspace_id],
        )?;
        tx.commit()?;
        Ok(Some(previous))
    }

    // Membership operations

    fn add_member(&self, membership: &Membership) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_workspace(&tx, &membership.workspace_id)?.is_none() {
            return Err(Error::NotFound);
        }
        let user_exists = tx
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![membership.user_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !user_exists {
            return Err(Error::NotFound);
        }

        // The seat-limit trigger runs inside this insert
        insert_membership(&tx, membership)?;
        tx.commit()?;
        Ok(())
    }

    fn get_membership(&self, user_id: &str, workspace_id: &str) -> Result<Option<Membership>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT user_id, workspace_id, role, joined_at FROM memberships
             WHERE user_id = ?1 AND workspace_id = ?2",
            params![user_id, workspace_id],
            |row| {
                Ok(Membership {
                    user_id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    role: parse_role(&row.get::<_, String>(2)?),
                    joined_at: parse_datetime(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_members(&self, workspace_id: &str) -> Result<Vec<Member>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.primary_email, u.display_name, u.avatar_url, m.role, m.joined_at
             FROM memberships m
             JOIN users u ON u.id = m.user_id
             WHERE m.workspace_id = ?1
             ORDER BY m.joined_at, u.id",
        )?;

        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok(Member {
                user_id: row.get(0)?,
                email: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
                role: parse_role(&row.get::<_, String>(4)?),
                joined_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_member_role(&self, user_id: &str, workspace_id: &str, role: Role) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE memberships SET role = ?1 WHERE user_id = ?2 AND workspace_id = ?3",
            params![role.as_str(), user_id, workspace_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn remove_member(&self, user_id: &str, workspace_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM memberships WHERE user_id = ?1 AND workspace_id = ?2",
            params![user_id, workspace_id],
        )?;
        Ok(rows > 0)
    }

    // Project operations

    fn create_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn();
        insert_project(&conn, project)
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            project_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_projects(&self, workspace_id: &str) -> Result<Vec<Project>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE workspace_id = ?1 ORDER BY created_at, name"
        ))?;

        let rows = stmt.query_map(params![workspace_id], project_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_project(&self, project: &Project) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE projects SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    project.name,
                    project.description,
                    format_datetime(&project.updated_at),
                    project.id,
                ],
            )
            .map_err(unique_error)?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_project(&self, id: &str, freed_bytes: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let workspace_id: Option<String> = tx
            .query_row(
                "SELECT workspace_id FROM projects WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(workspace_id) = workspace_id else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE workspaces SET storage_used_bytes = MAX(0, storage_used_bytes - ?1),
                 updated_at = ?2
             WHERE id = ?3",
            params![freed_bytes.max(0), format_datetime(&Utc::now()), workspace_id],
        )?;
        tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;

        tx.commit()?;
        Ok(true)
    }

    // Token operations

    fn create_token(&self, token: &Token) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO tokens (id, token_hash, token_lookup, is_admin, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.is_admin,
                token.user_id,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::TokenLookupCollision),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_token_by_id(&self, id: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
            params![id],
            token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_lookup = ?1"),
            params![lookup],
            token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![cursor, limit], token_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_user_tokens(&self, user_id: &str) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], token_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_token(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_token_last_used(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn has_admin_token(&self) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tokens WHERE is_admin = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // OAuth state operations

    fn create_oauth_state(&self, state: &OAuthState) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO oauth_states (state, provider, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    state.state,
                    state.provider.as_str(),
                    format_datetime(&state.created_at),
                    format_datetime(&state.expires_at),
                ],
            )
            .map_err(unique_error)?;
        Ok(())
    }

    fn redeem_oauth_state(
        &self,
        state: &str,
        provider: OAuthProvider,
        now: DateTime<Utc>,
    ) -> Result<StateRedemption> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<(String, String)> = tx
            .query_row(
                "SELECT provider, expires_at FROM oauth_states WHERE state = ?1",
                params![state],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stored_provider, expires_at)) = stored else {
            return Ok(StateRedemption::Unknown);
        };

        tx.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])?;
        tx.commit()?;

        if OAuthProvider::parse(&stored_provider) != Some(provider) {
            return Ok(StateRedemption::ProviderMismatch);
        }
        if now >= parse_datetime(&expires_at) {
            return Ok(StateRedemption::Expired);
        }
        Ok(StateRedemption::Valid)
    }

    fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM oauth_states WHERE expires_at <= ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // AI usage

    fn record_ai_usage(&self, usage: &AiUsage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO ai_usage (id, user_id, workspace_id, provider, model_name,
                 input_tokens, output_tokens, cost_cents, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                usage.id,
                usage.user_id,
                usage.workspace_id,
                usage.provider,
                usage.model_name,
                usage.input_tokens,
                usage.output_tokens,
                usage.cost_cents,
                format_datetime(&usage.created_at),
            ],
        )?;
        Ok(())
    }

    fn ai_usage_summary(&self, workspace_id: &str) -> Result<AiUsageSummary> {
        let conn = self.conn();
        conn.query_row(
            // TOTAL() sums as a float and cannot overflow; the casts saturate
            "SELECT COUNT(*), TOTAL(input_tokens), TOTAL(output_tokens), TOTAL(cost_cents)
             FROM ai_usage WHERE workspace_id = ?1",
            params![workspace_id],
            |row| {
                Ok(AiUsageSummary {
                    total_requests: row.get(0)?,
                    total_input_tokens: row.get::<_, f64>(1)? as i64,
                    total_output_tokens: row.get::<_, f64>(2)? as i64,
                    total_cost_cents: row.get::<_, f64>(3)? as i64,
                })
            },
        )
        .map_err(Error::from)
    }

    // Audit log

    fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn();
        insert_audit(&conn, entry)
    }

    fn list_audit_entries(&self, workspace_id: &str, limit: i32) -> Result<Vec<AuditEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, workspace_id, action, resource_type, resource_id, details,
                 ip_address, user_agent, created_at
             FROM audit_log WHERE workspace_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![workspace_id, limit], audit_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn stats(&self) -> Result<SystemStats> {
        let conn = self.conn();
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0))
                .map_err(Error::from)
        };

        let total_users = count("SELECT COUNT(*) FROM users")?;
        let total_workspaces = count("SELECT COUNT(*) FROM workspaces")?;
        let cancelled_workspaces =
            count("SELECT COUNT(*) FROM workspaces WHERE cancelled_at IS NOT NULL")?;
        let total_projects = count("SELECT COUNT(*) FROM projects")?;
        let total_storage_bytes =
            count("SELECT COALESCE(SUM(storage_used_bytes), 0) FROM workspaces")?;

        let mut stmt = conn.prepare(
            "SELECT p.name, COUNT(w.id)
             FROM plans p JOIN workspaces w ON w.plan_id = p.id
             GROUP BY p.id ORDER BY p.price_cents",
        )?;
        let workspaces_by_plan = stmt
            .query_map([], |row| {
                Ok(PlanCount {
                    plan: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(SystemStats {
            total_users,
            total_workspaces,
            cancelled_workspaces,
            total_projects,
            total_storage_bytes,
            workspaces_by_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    fn new_user(email: &str) -> User {
        User {
            id: uuid::Uuid::new_v4().to_string(),
            primary_email: email.to_string(),
            display_name: None,
            avatar_url: None,
            provider: "github".to_string(),
            provider_user_id: format!("gh-{email}"),
            google_avatar_url: None,
            github_avatar_url: None,
            linked_providers: vec!["github".to_string()],
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    fn member(user_id: &str, workspace_id: &str, role: Role) -> Membership {
        Membership {
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            role,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn test_initialize_creates_tables_and_plans() {
        let (_temp, store) = setup();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        drop(conn);

        for table in [
            "users",
            "plans",
            "workspaces",
            "memberships",
            "projects",
            "ai_usage",
            "oauth_states",
            "audit_log",
            "tokens",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        let plans = store.list_plans().unwrap();
        let ids: Vec<_> = plans.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["free", "haste_i", "haste_ii", "haste_iii"]);
        assert_eq!(plans[0].max_members, 1);
        assert_eq!(plans[0].storage_limit_bytes, 902_299_238);

        // Re-running the schema must not duplicate seeds
        store.initialize().unwrap();
        assert_eq!(store.list_plans().unwrap().len(), 4);
    }

    #[test]
    fn test_provision_creates_workspace_membership_and_project() {
        let (_temp, store) = setup();
        let user = new_user("ada@example.com");

        let provisioned = store.provision_user(&user).unwrap();
        assert_eq!(provisioned.workspace.owner_user_id, user.id);
        assert_eq!(provisioned.workspace.plan_id, FREE_PLAN_ID);
        assert_eq!(provisioned.project.name, DEFAULT_PROJECT_NAME);

        let workspaces = store.list_user_workspaces(&user.id).unwrap();
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].1, Role::Admin);

        let ws_id = &provisioned.workspace.id;
        assert_eq!(store.count_members(ws_id).unwrap(), 1);
        assert_eq!(store.count_projects(ws_id).unwrap(), 1);
    }

    #[test]
    fn test_provision_duplicate_email_writes_nothing() {
        let (_temp, store) = setup();
        store.provision_user(&new_user("ada@example.com")).unwrap();

        let mut dup = new_user("ada@example.com");
        dup.provider_user_id = "other".to_string();
        let err = store.provision_user(&dup).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));

        assert!(store.get_user(&dup.id).unwrap().is_none());
        assert_eq!(store.list_workspaces().unwrap().len(), 1);
    }

    #[test]
    fn test_free_plan_allows_single_seat() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let guest = store.provision_user(&new_user("guest@example.com")).unwrap();

        let err = store
            .add_member(&member(&guest.user.id, &owner.workspace.id, Role::User))
            .unwrap_err();
        assert!(matches!(err, Error::SeatLimitExceeded));
        assert_eq!(store.count_members(&owner.workspace.id).unwrap(), 1);
    }

    #[test]
    fn test_add_member_errors() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store
            .activate_subscription(ws_id, "haste_i", Some("cus_1"), Some("sub_1"))
            .unwrap();

        let err = store
            .add_member(&member(&owner.user.id, ws_id, Role::User))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));

        let err = store
            .add_member(&member("no-such-user", ws_id, Role::User))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));

        let err = store
            .add_member(&member(&owner.user.id, "no-such-ws", Role::User))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_concurrent_invites_never_exceed_seat_limit() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path).unwrap());
        store.initialize().unwrap();

        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = owner.workspace.id.clone();
        store
            .activate_subscription(&ws_id, "haste_i", None, None)
            .unwrap();

        let invitees: Vec<String> = (0..8)
            .map(|i| {
                store
                    .provision_user(&new_user(&format!("guest{i}@example.com")))
                    .unwrap()
                    .user
                    .id
            })
            .collect();

        // Separate connections so the writers really contend on the database file
        let handles: Vec<_> = invitees
            .into_iter()
            .map(|user_id| {
                let db_path = db_path.clone();
                let ws_id = ws_id.clone();
                std::thread::spawn(move || {
                    let store = SqliteStore::new(&db_path).unwrap();
                    store.add_member(&member(&user_id, &ws_id, Role::User))
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(()) => accepted += 1,
                Err(Error::SeatLimitExceeded) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(accepted, 2);
        assert_eq!(store.count_members(&ws_id).unwrap(), 3);
    }

    #[test]
    fn test_member_role_update_and_removal() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let guest = store.provision_user(&new_user("guest@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store
            .activate_subscription(ws_id, "haste_ii", None, None)
            .unwrap();

        store
            .add_member(&member(&guest.user.id, ws_id, Role::User))
            .unwrap();
        store
            .update_member_role(&guest.user.id, ws_id, Role::Mod)
            .unwrap();
        let membership = store.get_membership(&guest.user.id, ws_id).unwrap().unwrap();
        assert_eq!(membership.role, Role::Mod);

        let members = store.list_members(ws_id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].email, "owner@example.com");

        assert!(store.remove_member(&guest.user.id, ws_id).unwrap());
        assert!(!store.remove_member(&guest.user.id, ws_id).unwrap());
        assert!(matches!(
            store.update_member_role(&guest.user.id, ws_id, Role::User),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_adjust_storage_quota_and_clamp() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;

        assert_eq!(store.adjust_storage(ws_id, 1000).unwrap(), 1000);
        assert_eq!(store.adjust_storage(ws_id, -400).unwrap(), 600);
        assert_eq!(store.adjust_storage(ws_id, -5000).unwrap(), 0);

        let err = store.adjust_storage(ws_id, 902_299_239).unwrap_err();
        match err {
            Error::QuotaExceeded { used, limit } => {
                assert_eq!(used, 902_299_239);
                assert_eq!(limit, 902_299_238);
            }
            other => panic!("expected quota error, got {other}"),
        }

        // Exactly at the limit is allowed
        assert_eq!(store.adjust_storage(ws_id, 902_299_238).unwrap(), 902_299_238);

        assert_eq!(store.release_storage(ws_id, 2_000_000_000).unwrap(), 0);
        assert!(matches!(
            store.adjust_storage("missing", 1),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_read_only_workspace_rejects_storage_changes() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store.adjust_storage(ws_id, 100).unwrap();

        store.cancel_workspace(ws_id, Utc::now()).unwrap();
        assert!(matches!(store.adjust_storage(ws_id, 1), Err(Error::ReadOnly)));
        assert!(matches!(store.adjust_storage(ws_id, -1), Err(Error::ReadOnly)));

        // Compensation still applies
        assert_eq!(store.release_storage(ws_id, 40).unwrap(), 60);
    }

    #[test]
    fn test_set_storage_used_reports_drift() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store.adjust_storage(ws_id, 500).unwrap();

        assert_eq!(store.set_storage_used(ws_id, 500).unwrap(), None);
        assert_eq!(store.set_storage_used(ws_id, 120).unwrap(), Some(500));
        assert_eq!(
            store.get_workspace(ws_id).unwrap().unwrap().storage_used_bytes,
            120
        );
    }

    #[test]
    fn test_cancel_is_idempotent_and_keeps_clock() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;

        let t0 = Utc::now() - Duration::days(3);
        let first = store.cancel_workspace(ws_id, t0).unwrap();
        assert!(first.is_read_only);
        assert_eq!(first.delete_after, Some(Workspace::deletion_deadline(t0)));

        let second = store.cancel_workspace(ws_id, Utc::now()).unwrap();
        assert_eq!(second.cancelled_at, first.cancelled_at);
        assert_eq!(second.delete_after, first.delete_after);

        let reactivated = store.reactivate_workspace(ws_id).unwrap();
        assert!(!reactivated.is_read_only);
        assert!(reactivated.cancelled_at.is_none());
        assert!(reactivated.delete_after.is_none());
    }

    #[test]
    fn test_purge_eligible_exactly_at_deadline() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;

        let cancelled_at = Utc::now() - Duration::days(40);
        let ws = store.cancel_workspace(ws_id, cancelled_at).unwrap();
        let deadline = ws.delete_after.unwrap();

        assert!(
            store
                .list_purge_candidates(deadline - Duration::seconds(1))
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.list_purge_candidates(deadline).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_deletes_dependents_and_keeps_audit() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = owner.workspace.id.clone();
        store
            .record_ai_usage(&AiUsage {
                id: "usage-1".to_string(),
                user_id: owner.user.id.clone(),
                workspace_id: ws_id.clone(),
                provider: "gemini".to_string(),
                model_name: None,
                input_tokens: Some(10),
                output_tokens: Some(20),
                cost_cents: Some(0),
                created_at: Utc::now(),
            })
            .unwrap();

        let cancelled_at = Utc::now() - Duration::days(31);
        store.cancel_workspace(&ws_id, cancelled_at).unwrap();

        let audit = AuditEntry::new("workspace.purged")
            .in_workspace(&ws_id)
            .resource("workspace", &ws_id);
        assert!(store.purge_workspace(&ws_id, Utc::now(), &audit).unwrap());

        assert!(store.get_workspace(&ws_id).unwrap().is_none());
        assert!(store.get_project(&owner.project.id).unwrap().is_none());
        assert_eq!(store.count_members(&ws_id).unwrap(), 0);
        assert_eq!(store.ai_usage_summary(&ws_id).unwrap().total_requests, 0);

        let conn = store.conn();
        let (workspace_ref, resource_id): (Option<String>, String) = conn
            .query_row(
                "SELECT workspace_id, resource_id FROM audit_log WHERE action = 'workspace.purged'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        drop(conn);
        assert!(workspace_ref.is_none());
        assert_eq!(resource_id, ws_id);

        // Second run is a no-op
        let again = AuditEntry::new("workspace.purged").resource("workspace", &ws_id);
        assert!(!store.purge_workspace(&ws_id, Utc::now(), &again).unwrap());
    }

    #[test]
    fn test_purge_skips_workspace_not_yet_due() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store.cancel_workspace(ws_id, Utc::now()).unwrap();

        let audit = AuditEntry::new("workspace.purged").in_workspace(ws_id);
        assert!(!store.purge_workspace(ws_id, Utc::now(), &audit).unwrap());
        assert!(store.get_workspace(ws_id).unwrap().is_some());
        assert!(store.list_audit_entries(ws_id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_delete_project_releases_storage() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store.adjust_storage(ws_id, 300).unwrap();

        assert!(store.delete_project(&owner.project.id, 200).unwrap());
        assert_eq!(
            store.get_workspace(ws_id).unwrap().unwrap().storage_used_bytes,
            100
        );
        assert!(!store.delete_project(&owner.project.id, 200).unwrap());
    }

    #[test]
    fn test_project_names_unique_per_workspace() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();

        let dup = Project {
            id: "p-2".to_string(),
            workspace_id: owner.workspace.id.clone(),
            name: DEFAULT_PROJECT_NAME.to_string(),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(
            store.create_project(&dup),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_oauth_state_single_use() {
        let (_temp, store) = setup();
        let now = Utc::now();
        store
            .create_oauth_state(&OAuthState::new(
                "state-1".to_string(),
                OAuthProvider::Google,
                now,
            ))
            .unwrap();

        assert_eq!(
            store
                .redeem_oauth_state("state-1", OAuthProvider::Google, now)
                .unwrap(),
            StateRedemption::Valid
        );
        assert_eq!(
            store
                .redeem_oauth_state("state-1", OAuthProvider::Google, now)
                .unwrap(),
            StateRedemption::Unknown
        );
    }

    #[test]
    fn test_oauth_state_expiry_and_mismatch_consume_state() {
        let (_temp, store) = setup();
        let created = Utc::now() - Duration::minutes(10);
        store
            .create_oauth_state(&OAuthState::new(
                "old".to_string(),
                OAuthProvider::Google,
                created,
            ))
            .unwrap();
        store
            .create_oauth_state(&OAuthState::new(
                "other".to_string(),
                OAuthProvider::GitHub,
                Utc::now(),
            ))
            .unwrap();

        assert_eq!(
            store
                .redeem_oauth_state("old", OAuthProvider::Google, Utc::now())
                .unwrap(),
            StateRedemption::Expired
        );
        assert_eq!(
            store
                .redeem_oauth_state("other", OAuthProvider::Google, Utc::now())
                .unwrap(),
            StateRedemption::ProviderMismatch
        );
        assert_eq!(
            store
                .redeem_oauth_state("other", OAuthProvider::GitHub, Utc::now())
                .unwrap(),
            StateRedemption::Unknown
        );
    }

    #[test]
    fn test_delete_expired_oauth_states() {
        let (_temp, store) = setup();
        let now = Utc::now();
        store
            .create_oauth_state(&OAuthState::new(
                "stale".to_string(),
                OAuthProvider::GitHub,
                now - Duration::minutes(30),
            ))
            .unwrap();
        store
            .create_oauth_state(&OAuthState::new(
                "fresh".to_string(),
                OAuthProvider::GitHub,
                now,
            ))
            .unwrap();

        assert_eq!(store.delete_expired_oauth_states(now).unwrap(), 1);
        assert_eq!(
            store
                .redeem_oauth_state("fresh", OAuthProvider::GitHub, now)
                .unwrap(),
            StateRedemption::Valid
        );
    }

    #[test]
    fn test_upsert_oauth_user_links_by_email() {
        let (_temp, store) = setup();
        let github = OAuthIdentity {
            provider: OAuthProvider::GitHub,
            provider_user_id: "gh-1".to_string(),
            email: "ada@example.com".to_string(),
            display_name: Some("Ada".to_string()),
            avatar_url: Some("gh.png".to_string()),
        };
        let (user, created) = store.upsert_oauth_user(&github, Utc::now()).unwrap();
        assert!(created);
        assert_eq!(store.list_user_workspaces(&user.id).unwrap().len(), 1);

        let google = OAuthIdentity {
            provider: OAuthProvider::Google,
            provider_user_id: "g-1".to_string(),
            email: "ada@example.com".to_string(),
            display_name: None,
            avatar_url: Some("g.png".to_string()),
        };
        let (linked, created) = store.upsert_oauth_user(&google, Utc::now()).unwrap();
        assert!(!created);
        assert_eq!(linked.id, user.id);

        let stored = store.get_user(&user.id).unwrap().unwrap();
        assert_eq!(stored.linked_providers, vec!["github", "google"]);
        assert_eq!(stored.avatar_url.as_deref(), Some("g.png"));
        assert_eq!(stored.github_avatar_url.as_deref(), Some("gh.png"));
        assert_eq!(store.list_workspaces().unwrap().len(), 1);
    }

    #[test]
    fn test_email_matching_ignores_case() {
        let (_temp, store) = setup();
        let google = OAuthIdentity {
            provider: OAuthProvider::Google,
            provider_user_id: "g-ada".to_string(),
            email: "Ada.Lovelace@Example.com".to_string(),
            display_name: None,
            avatar_url: None,
        };
        let (user, created) = store.upsert_oauth_user(&google, Utc::now()).unwrap();
        assert!(created);
        assert_eq!(user.primary_email, "ada.lovelace@example.com");

        let found = store
            .get_user_by_email("ada.lovelace@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.get_user_by_email("ADA.LOVELACE@EXAMPLE.COM").unwrap().is_some());

        let github = OAuthIdentity {
            provider: OAuthProvider::GitHub,
            provider_user_id: "gh-ada".to_string(),
            email: "ada.lovelace@EXAMPLE.com".to_string(),
            display_name: None,
            avatar_url: None,
        };
        let (linked, created) = store.upsert_oauth_user(&github, Utc::now()).unwrap();
        assert!(!created);
        assert_eq!(linked.id, user.id);
        assert_eq!(store.list_workspaces().unwrap().len(), 1);

        // Rows written without normalisation still collide on case
        assert!(matches!(
            store.provision_user(&new_user("ADA.lovelace@example.com")),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_delete_user_cascades() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();

        assert!(store.delete_user(&owner.user.id).unwrap());
        assert!(store.get_workspace(&owner.workspace.id).unwrap().is_none());
        assert!(store.get_project(&owner.project.id).unwrap().is_none());
    }

    #[test]
    fn test_activate_subscription_clears_cancellation() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store.cancel_workspace(ws_id, Utc::now()).unwrap();

        let ws = store
            .activate_subscription(ws_id, "haste_ii", Some("cus_9"), Some("sub_9"))
            .unwrap();
        assert_eq!(ws.plan_id, "haste_ii");
        assert!(!ws.is_read_only);
        assert!(ws.cancelled_at.is_none());

        let by_sub = store.get_workspace_by_subscription("sub_9").unwrap().unwrap();
        assert_eq!(by_sub.id, *ws_id);

        assert!(matches!(
            store.activate_subscription(ws_id, "platinum", None, None),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_downgrade_below_member_count_is_rejected() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;
        store
            .activate_subscription(ws_id, "haste_ii", None, Some("sub_big"))
            .unwrap();

        for i in 0..5 {
            let user = store
                .provision_user(&new_user(&format!("member{i}@example.com")))
                .unwrap();
            store
                .add_member(&member(&user.user.id, ws_id, Role::User))
                .unwrap();
        }
        assert_eq!(store.count_members(ws_id).unwrap(), 6);

        assert!(matches!(
            store.activate_subscription(ws_id, "haste_i", None, None),
            Err(Error::SeatLimitExceeded)
        ));
        let ws = store.get_workspace(ws_id).unwrap().unwrap();
        assert_eq!(ws.plan_id, "haste_ii");

        // Exactly at the new limit is fine
        let users = store.list_members(ws_id).unwrap();
        for m in users.iter().filter(|m| m.user_id != owner.user.id).take(3) {
            store.remove_member(&m.user_id, ws_id).unwrap();
        }
        let ws = store
            .activate_subscription(ws_id, "haste_i", None, None)
            .unwrap();
        assert_eq!(ws.plan_id, "haste_i");
        assert_eq!(store.count_members(ws_id).unwrap(), 3);

        assert!(matches!(
            store.activate_subscription("missing", "haste_i", None, None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_ai_usage_summary() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();
        let ws_id = &owner.workspace.id;

        for (i, cost) in [Some(3), None].into_iter().enumerate() {
            store
                .record_ai_usage(&AiUsage {
                    id: format!("usage-{i}"),
                    user_id: owner.user.id.clone(),
                    workspace_id: ws_id.clone(),
                    provider: "gemini".to_string(),
                    model_name: Some("gemini-pro".to_string()),
                    input_tokens: Some(100),
                    output_tokens: cost.map(|_| 50),
                    cost_cents: cost,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let summary = store.ai_usage_summary(ws_id).unwrap();
        assert_eq!(
            summary,
            AiUsageSummary {
                total_requests: 2,
                total_input_tokens: 200,
                total_output_tokens: 50,
                total_cost_cents: 3,
            }
        );
    }

    #[test]
    fn test_token_crud() {
        let (_temp, store) = setup();
        let owner = store.provision_user(&new_user("owner@example.com")).unwrap();

        let token = Token {
            id: "tok-1".to_string(),
            token_hash: "hash".to_string(),
            token_lookup: "lookup01".to_string(),
            is_admin: false,
            user_id: Some(owner.user.id.clone()),
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        store.create_token(&token).unwrap();

        let mut dup = token.clone();
        dup.id = "tok-2".to_string();
        assert!(matches!(
            store.create_token(&dup),
            Err(Error::TokenLookupCollision)
        ));

        let fetched = store.get_token_by_lookup("lookup01").unwrap().unwrap();
        assert_eq!(fetched.user_id.as_deref(), Some(owner.user.id.as_str()));
        assert_eq!(store.list_user_tokens(&owner.user.id).unwrap().len(), 1);
        assert!(!store.has_admin_token().unwrap());

        store.update_token_last_used("tok-1").unwrap();
        assert!(
            store
                .get_token_by_id("tok-1")
                .unwrap()
                .unwrap()
                .last_used_at
                .is_some()
        );

        assert!(store.delete_token("tok-1").unwrap());
        assert!(store.get_token_by_id("tok-1").unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let (_temp, store) = setup();
        let a = store.provision_user(&new_user("a@example.com")).unwrap();
        store.provision_user(&new_user("b@example.com")).unwrap();
        store
            .activate_subscription(&a.workspace.id, "haste_i", None, None)
            .unwrap();
        store.adjust_storage(&a.workspace.id, 42).unwrap();
        store.cancel_workspace(&a.workspace.id, Utc::now()).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.total_workspaces, 2);
        assert_eq!(stats.cancelled_workspaces, 1);
        assert_eq!(stats.total_projects, 2);
        assert_eq!(stats.total_storage_bytes, 42);
        assert_eq!(stats.workspaces_by_plan.len(), 2);
        assert_eq!(stats.workspaces_by_plan[0].plan, "Free");
    }
}
