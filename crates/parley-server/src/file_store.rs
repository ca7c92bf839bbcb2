//! On-disk storage for transferred files.
//!
//! Uploads accumulate in `staging/<transfer_id>` one chunk at a time and
//! are promoted to `blobs/<file_id>` when complete. Paths are derived from
//! UUIDs only; client-supplied file names never touch the filesystem.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use parley_shared::types::{FileId, TransferId};

use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct FileStore {
    staging_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl FileStore {
    pub async fn new(base_path: PathBuf) -> Result<Self, ServerError> {
        let staging_dir = base_path.join("staging");
        let blobs_dir = base_path.join("blobs");

        fs::create_dir_all(&staging_dir).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create staging directory '{}': {}",
                staging_dir.display(),
                e
            ))
        })?;
        fs::create_dir_all(&blobs_dir).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create blobs directory '{}': {}",
                blobs_dir.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "File store initialized");

        Ok(Self {
            staging_dir,
            blobs_dir,
        })
    }

    fn staging_path(&self, id: TransferId) -> PathBuf {
        self.staging_dir.join(id.to_string())
    }

    pub fn blob_path(&self, id: FileId) -> PathBuf {
        self.blobs_dir.join(id.to_string())
    }

    /// Create an empty staging file for a new upload.
    pub async fn create_staging(&self, id: TransferId) -> Result<(), ServerError> {
        let path = self.staging_path(id);
        fs::write(&path, b"").await.map_err(|e| {
            ServerError::Internal(format!("Failed to create staging file {}: {}", id, e))
        })?;
        debug!(transfer = %id, "Created staging file");
        Ok(())
    }

    /// Append one chunk to a staged upload.
    pub async fn append_staging(&self, id: TransferId, data: &[u8]) -> Result<(), ServerError> {
        let path = self.staging_path(id);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                ServerError::Internal(format!("Failed to open staging file {}: {}", id, e))
            })?;
        file.write_all(data).await.map_err(|e| {
            ServerError::Internal(format!("Failed to write staging file {}: {}", id, e))
        })?;
        Ok(())
    }

    /// Remove a staged upload, ignoring files that never materialized.
    pub async fn discard_staging(&self, id: TransferId) {
        let path = self.staging_path(id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(transfer = %id, error = %e, "Failed to discard staging file");
            }
        } else {
            debug!(transfer = %id, "Discarded staging file");
        }
    }

    /// Promote a completed upload to its final blob location.
    pub async fn promote_staging(&self, id: TransferId, file_id: FileId) -> Result<(), ServerError> {
        let from = self.staging_path(id);
        let to = self.blob_path(file_id);
        fs::rename(&from, &to).await.map_err(|e| {
            ServerError::Internal(format!("Failed to promote staging file {}: {}", id, e))
        })?;
        debug!(transfer = %id, file = %file_id, "Promoted upload to blob");
        Ok(())
    }

    /// Open a stored blob for a download stream.
    pub async fn open_blob(&self, id: FileId) -> Result<fs::File, ServerError> {
        let path = self.blob_path(id);
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::FileNotFound(id.to_string()))
            }
            Err(e) => Err(ServerError::Internal(format!(
                "Failed to open blob {}: {}",
                id, e
            ))),
        }
    }

    /// Read a whole blob into memory. Intended for tests and small files.
    pub async fn read_blob(&self, id: FileId) -> Result<Vec<u8>, ServerError> {
        let path = self.blob_path(id);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::FileNotFound(id.to_string()))
            }
            Err(e) => Err(ServerError::Internal(format!(
                "Failed to read blob {}: {}",
                id, e
            ))),
        }
    }

    #[allow(dead_code)]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}
