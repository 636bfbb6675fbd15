//! Project file storage on the local filesystem.
//!
//! Objects live under `<data_dir>/objects/workspace_<id>/project_<id>/<path>`.
//! Writes go to a scratch file first and are renamed into place, so a failed
//! upload never leaves a partial object behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::store::path::normalize_object_path;

const WORKSPACE_DIR_PREFIX: &str = "workspace_";
const PROJECT_DIR_PREFIX: &str = "project_";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    fn from_io(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Io(e)
        }
    }
}

/// A stored file as seen by listings.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub path: String,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(objects_dir: &Path) -> Self {
        Self {
            base_path: objects_dir.to_path_buf(),
        }
    }

    fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.base_path
            .join(format!("{WORKSPACE_DIR_PREFIX}{workspace_id}"))
    }

    fn project_dir(&self, workspace_id: &str, project_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id)
            .join(format!("{PROJECT_DIR_PREFIX}{project_id}"))
    }

    fn object_path(
        &self,
        workspace_id: &str,
        project_id: &str,
        path: &str,
    ) -> Result<PathBuf, StorageError> {
        let normalized =
            normalize_object_path(path).map_err(|e| StorageError::InvalidPath(e.to_string()))?;
        Ok(self.project_dir(workspace_id, project_id).join(normalized))
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(TMP_DIR)
            .join(Uuid::new_v4().to_string())
    }

    /// Size of an existing object, or `None` if there is none at `path`.
    pub async fn size(
        &self,
        workspace_id: &str,
        project_id: &str,
        path: &str,
    ) -> Result<Option<i64>, StorageError> {
        let object = self.object_path(workspace_id, project_id, path)?;
        match fs::metadata(&object).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len() as i64)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn get(
        &self,
        workspace_id: &str,
        project_id: &str,
        path: &str,
    ) -> Result<(BufReader<File>, i64), StorageError> {
        let object = self.object_path(workspace_id, project_id, path)?;
        let file = File::open(&object).await.map_err(StorageError::from_io)?;

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }

        Ok((BufReader::new(file), metadata.len() as i64))
    }

    pub async fn put(
        &self,
        workspace_id: &str,
        project_id: &str,
        path: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let final_path = self.object_path(workspace_id, project_id, path)?;

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_file = File::create(&temp_path).await?;
        let written = async {
            temp_file.write_all(data).await?;
            temp_file.sync_all().await?;
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    /// Deletes an object and returns the bytes it occupied.
    pub async fn delete(
        &self,
        workspace_id: &str,
        project_id: &str,
        path: &str,
    ) -> Result<Option<i64>, StorageError> {
        let Some(size) = self.size(workspace_id, project_id, path).await? else {
            return Ok(None);
        };
        let object = self.object_path(workspace_id, project_id, path)?;

        match fs::remove_file(&object).await {
            Ok(()) => Ok(Some(size)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Lists objects in a project whose path starts with `prefix`, sorted by path.
    pub async fn list(
        &self,
        workspace_id: &str,
        project_id: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.project_dir(workspace_id, project_id);
        let mut objects: Vec<ObjectInfo> = walk_files(&root)
            .await?
            .into_iter()
            .filter(|obj| obj.path.starts_with(prefix))
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    pub async fn project_usage(
        &self,
        workspace_id: &str,
        project_id: &str,
    ) -> Result<i64, StorageError> {
        let root = self.project_dir(workspace_id, project_id);
        Ok(walk_files(&root).await?.iter().map(|o| o.size_bytes).sum())
    }

    /// Actual bytes on disk for a workspace.
    pub async fn workspace_usage(&self, workspace_id: &str) -> Result<i64, StorageError> {
        let root = self.workspace_dir(workspace_id);
        Ok(walk_files(&root).await?.iter().map(|o| o.size_bytes).sum())
    }

    /// Removes a project's object tree and returns the bytes freed.
    pub async fn delete_project(
        &self,
        workspace_id: &str,
        project_id: &str,
    ) -> Result<i64, StorageError> {
        let freed = self.project_usage(workspace_id, project_id).await?;
        remove_tree(&self.project_dir(workspace_id, project_id)).await?;
        Ok(freed)
    }

    /// Removes a workspace's object tree. Returns false if there was nothing to remove.
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<bool, StorageError> {
        remove_tree(&self.workspace_dir(workspace_id)).await
    }

    /// Ids of every workspace that has an object tree.
    pub async fn list_workspace_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_prefix(WORKSPACE_DIR_PREFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Packs a workspace's object tree into a gzip-compressed tar archive.
    ///
    /// Entries are named `project_<id>/<path>`. The archive is built in a
    /// scratch file that is unlinked once opened, so the returned handle is
    /// the only reference to it.
    pub async fn export_workspace(&self, workspace_id: &str) -> Result<(File, i64), StorageError> {
        let root = self.workspace_dir(workspace_id);
        let mut objects = walk_files(&root).await?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let archive_path = temp_path.clone();
        let built = tokio::task::spawn_blocking(move || write_archive(&archive_path, &root, &objects))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        if let Err(e) = built {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        let file = File::open(&temp_path).await?;
        let size = file.metadata().await?.len() as i64;
        if let Err(e) = fs::remove_file(&temp_path).await {
            tracing::warn!("Failed to unlink export scratch file: {e}");
        }
        Ok((file, size))
    }

    /// Removes scratch files last modified before `cutoff`. Returns how many were removed.
    pub async fn remove_stale_temp_files(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut entries = match fs::read_dir(self.base_path.join(TMP_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            // Uploads rename their scratch file away while we scan
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            if modified.is_some_and(|m| m >= cutoff) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(removed)
    }
}

fn write_archive(dest: &Path, root: &Path, objects: &[ObjectInfo]) -> std::io::Result<()> {
    let file = std::fs::File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for object in objects {
        builder.append_path_with_name(root.join(&object.path), &object.path)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()
}

async fn remove_tree(dir: &Path) -> Result<bool, StorageError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Collects every regular file below `root` with its path relative to `root`.
async fn walk_files(root: &Path) -> Result<Vec<ObjectInfo>, StorageError> {
    let mut objects = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let metadata = entry.metadata().await?;
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                objects.push(ObjectInfo {
                    path: relative,
                    size_bytes: metadata.len() as i64,
                    modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
    }

    Ok(objects)
}
