//! Periodic maintenance jobs triggered by the scheduler endpoints.
//!
//! Every job is idempotent: a failed item is logged, reported and retried on
//! the next run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::storage::FileStorage;
use crate::store::Store;
use crate::types::AuditEntry;

/// Scratch files older than this belong to uploads or exports that never finished.
const STALE_TEMP_AGE: Duration = Duration::hours(24);

#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub workspace_id: String,
    pub error: String,
}

impl JobError {
    fn new(workspace_id: &str, error: impl std::fmt::Display) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub reconciled_count: usize,
    pub corrected_count: usize,
    pub total_workspaces: usize,
    pub errors: Vec<JobError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub deleted_count: usize,
    pub total_candidates: usize,
    pub orphaned_trees_removed: usize,
    pub stale_temp_files_removed: usize,
    pub errors: Vec<JobError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted_count: usize,
}

/// Recomputes every workspace's storage counter from the bytes actually on disk.
///
/// The counter is overwritten with the measured total, so drift in either
/// direction is corrected in one pass.
pub async fn reconcile_storage(
    store: &dyn Store,
    storage: &FileStorage,
) -> Result<ReconcileReport> {
    let workspaces = store.list_workspaces()?;
    let mut report = ReconcileReport {
        reconciled_count: 0,
        corrected_count: 0,
        total_workspaces: workspaces.len(),
        errors: Vec::new(),
    };

    for workspace in &workspaces {
        let actual = match storage.workspace_usage(&workspace.id).await {
            Ok(actual) => actual,
            Err(e) => {
                tracing::error!(workspace_id = %workspace.id, "Failed to measure storage: {e}");
                report.errors.push(JobError::new(&workspace.id, e));
                continue;
            }
        };

        match store.set_storage_used(&workspace.id, actual) {
            Ok(Some(previous)) => {
                tracing::info!(
                    workspace_id = %workspace.id,
                    previous,
                    actual,
                    "Corrected storage drift"
                );
                report.corrected_count += 1;
                report.reconciled_count += 1;
            }
            Ok(None) => report.reconciled_count += 1,
            Err(e) => {
                tracing::error!(
                    workspace_id = %workspace.id,
                    "Failed to update storage counter: {e}"
                );
                report.errors.push(JobError::new(&workspace.id, e));
            }
        }
    }

    tracing::info!(
        "Storage reconciliation: {}/{} reconciled, {} corrected, {} errors",
        report.reconciled_count,
        report.total_workspaces,
        report.corrected_count,
        report.errors.len()
    );
    Ok(report)
}

/// Deletes workspaces whose deletion deadline has passed, then removes object
/// trees that no longer belong to any workspace and abandoned scratch files.
pub async fn purge_expired_workspaces(
    store: &dyn Store,
    storage: &FileStorage,
    now: DateTime<Utc>,
) -> Result<PurgeReport> {
    let candidates = store.list_purge_candidates(now)?;
    let mut report = PurgeReport {
        deleted_count: 0,
        total_candidates: candidates.len(),
        orphaned_trees_removed: 0,
        stale_temp_files_removed: 0,
        errors: Vec::new(),
    };

    for workspace in &candidates {
        let audit = AuditEntry::new("workspace.purged")
            .by_user(&workspace.owner_user_id)
            .in_workspace(&workspace.id)
            .resource("workspace", &workspace.id)
            .details(json!({
                "owner_user_id": workspace.owner_user_id,
                "plan_id": workspace.plan_id,
                "storage_used_bytes": workspace.storage_used_bytes,
                "cancelled_at": workspace.cancelled_at,
                "delete_after": workspace.delete_after,
            }));

        match store.purge_workspace(&workspace.id, now, &audit) {
            Ok(true) => {
                report.deleted_count += 1;
                tracing::info!(workspace_id = %workspace.id, "Purged cancelled workspace");
            }
            // Reactivated since the candidate list was read
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(workspace_id = %workspace.id, "Failed to purge workspace: {e}");
                report.errors.push(JobError::new(&workspace.id, e));
                continue;
            }
        }

        if let Err(e) = storage.delete_workspace(&workspace.id).await {
            tracing::error!(workspace_id = %workspace.id, "Failed to delete workspace files: {e}");
            report.errors.push(JobError::new(&workspace.id, e));
        }
    }

    // Trees left behind by earlier failures
    match storage.list_workspace_ids().await {
        Ok(ids) => {
            for id in ids {
                match store.get_workspace(&id) {
                    Ok(Some(_)) => {}
                    Ok(None) => match storage.delete_workspace(&id).await {
                        Ok(_) => report.orphaned_trees_removed += 1,
                        Err(e) => report.errors.push(JobError::new(&id, e)),
                    },
                    Err(e) => report.errors.push(JobError::new(&id, e)),
                }
            }
        }
        Err(e) => tracing::error!("Failed to list workspace object trees: {e}"),
    }

    match storage.remove_stale_temp_files(now - STALE_TEMP_AGE).await {
        Ok(removed) => report.stale_temp_files_removed = removed,
        Err(e) => tracing::error!("Failed to remove stale scratch files: {e}"),
    }

    tracing::info!(
        "Workspace purge: {}/{} deleted, {} orphaned trees removed, {} stale scratch files removed, {} errors",
        report.deleted_count,
        report.total_candidates,
        report.orphaned_trees_removed,
        report.stale_temp_files_removed,
        report.errors.len()
    );
    Ok(report)
}

pub fn cleanup_expired_oauth_states(
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<CleanupReport> {
    let deleted_count = store.delete_expired_oauth_states(now)?;
    tracing::info!("Removed {deleted_count} expired OAuth states");
    Ok(CleanupReport { deleted_count })
}
