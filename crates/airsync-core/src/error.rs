use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::maintenance::MaintenanceError;
use crate::media::MediaError;
use crate::snapshot::SnapshotError;
use crate::storage::StorageError;
use crate::table::TableError;
use crate::transform::TransformError;
use crate::upload::UploadError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Message(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("table source error: {0}")]
    Table(#[from] TableError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
    #[error("maintenance error: {0}")]
    Maintenance(#[from] MaintenanceError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn message<T: Into<String>>(message: T) -> Self {
        SyncError::Message(message.into())
    }
}
