use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::SyncError;
use crate::snapshot;
use crate::transform::{RecordTransformer, TransformError};
use crate::upload::{BatchSummary, ResourceClient};

/// Entities ready to send, built from the newest snapshot of a prefix.
#[derive(Debug)]
pub struct PreparedPush {
    pub snapshot: PathBuf,
    pub records: usize,
    pub entities: Vec<Value>,
    pub rejected: Vec<TransformError>,
}

#[derive(Debug)]
pub struct PushReport {
    pub prepared: PreparedPush,
    pub summary: BatchSummary,
}

/// Load the latest snapshot for `prefix` and transform it, dropping invalid records.
pub fn prepare_push(
    data_dir: &Path,
    prefix: &str,
    transformer: &RecordTransformer,
) -> Result<PreparedPush, SyncError> {
    let entry = snapshot::latest_snapshot(data_dir, prefix)?.ok_or_else(|| {
        SyncError::message(format!(
            "no snapshot for prefix {prefix} in {}",
            data_dir.display()
        ))
    })?;
    let records = snapshot::load_records(&entry.path)?;
    let (entities, rejected) = transformer.transform_all(&records);
    info!(
        prefix,
        destination = %transformer.destination(),
        snapshot = %entry.path.display(),
        records = records.len(),
        entities = entities.len(),
        rejected = rejected.len(),
        "prepared push"
    );
    Ok(PreparedPush {
        snapshot: entry.path,
        records: records.len(),
        entities,
        rejected,
    })
}

/// Transform the latest snapshot and upsert every entity by natural key.
pub async fn push_snapshot(
    data_dir: &Path,
    prefix: &str,
    transformer: &RecordTransformer,
    client: &ResourceClient,
) -> Result<PushReport, SyncError> {
    let prepared = prepare_push(data_dir, prefix, transformer)?;
    let summary = client.update_many(&prepared.entities).await;
    info!(
        prefix,
        resource = client.resource(),
        success = summary.success,
        failed = summary.failed,
        "push finished"
    );
    Ok(PushReport { prepared, summary })
}
