use std::sync::Arc;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::auth::RequireUser;
use crate::server::AppState;
use crate::server::dto::{FileDeleteResponse, FileWriteResponse, ListFilesParams};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::storage::StorageError;
use crate::store::path::{normalize_object_path, normalize_prefix};

use super::access::require_project;

fn storage_error(e: StorageError, message: &'static str) -> ApiError {
    match e {
        StorageError::NotFound => ApiError::not_found("File not found"),
        StorageError::InvalidPath(reason) => ApiError::bad_request(reason),
        StorageError::Io(e) => {
            tracing::error!("{message}: {e}");
            ApiError::internal(message)
        }
    }
}

fn object_path(raw: &str) -> Result<String, ApiError> {
    normalize_object_path(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

pub async fn list_files(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListFilesParams>,
) -> impl IntoResponse {
    let (project, access) = require_project(state.store.as_ref(), &auth.user, &id)?;
    access.require_readable()?;

    let prefix = normalize_prefix(params.prefix.as_deref())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let files = state
        .storage
        .list(&project.workspace_id, &project.id, &prefix)
        .await
        .map_err(|e| storage_error(e, "Failed to list files"))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(files)))
}

/// Writes the request body to `path`, charging the size difference against
/// the workspace quota before the write and refunding it if the write fails.
pub async fn upload_file(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let (project, access) = require_project(store, &auth.user, &id)?;
    access.require_writable()?;
    let path = object_path(&raw_path)?;
    let workspace_id = &project.workspace_id;

    let old_size = state
        .storage
        .size(workspace_id, &project.id, &path)
        .await
        .map_err(|e| storage_error(e, "Failed to stat file"))?
        .unwrap_or(0);
    let new_size = body.len() as i64;
    let delta = new_size - old_size;

    let reserved_usage = if delta > 0 {
        Some(
            store
                .adjust_storage(workspace_id, delta)
                .api_err("Failed to reserve storage")?,
        )
    } else {
        None
    };

    if let Err(e) = state
        .storage
        .put(workspace_id, &project.id, &path, &body)
        .await
    {
        if delta > 0 {
            if let Err(refund) = store.release_storage(workspace_id, delta) {
                tracing::error!(
                    workspace_id = %workspace_id,
                    "Failed to refund {delta} bytes: {refund}"
                );
            }
        }
        return Err(storage_error(e, "Failed to write file"));
    }

    // Shrinking writes release their bytes only once the write succeeded
    let storage_used_bytes = match reserved_usage {
        Some(used) => used,
        None => store
            .release_storage(workspace_id, -delta)
            .api_err("Failed to release storage")?,
    };

    Ok(Json(ApiResponse::success(FileWriteResponse {
        path,
        size_bytes: new_size,
        storage_used_bytes,
    })))
}

pub async fn download_file(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (project, access) = require_project(state.store.as_ref(), &auth.user, &id)?;
    access.require_readable()?;
    let path = object_path(&raw_path)?;

    let (reader, size) = state
        .storage
        .get(&project.workspace_id, &project.id, &path)
        .await
        .map_err(|e| storage_error(e, "Failed to read file"))?;

    let body = Body::from_stream(ReaderStream::new(reader));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header("X-Content-Type-Options", "nosniff")
        .body(body)
        .map_err(|_| ApiError::internal("Failed to build response"))
}

pub async fn delete_file(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let (project, access) = require_project(store, &auth.user, &id)?;
    access.require_writable()?;
    let path = object_path(&raw_path)?;

    let freed_bytes = state
        .storage
        .delete(&project.workspace_id, &project.id, &path)
        .await
        .map_err(|e| storage_error(e, "Failed to delete file"))?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let storage_used_bytes = store
        .release_storage(&project.workspace_id, freed_bytes)
        .api_err("Failed to release storage")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(FileDeleteResponse {
        path,
        freed_bytes,
        storage_used_bytes,
    })))
}
