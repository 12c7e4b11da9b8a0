use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::RawRecord;

const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is not a valid record array: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid snapshot prefix {0:?}")]
    InvalidPrefix(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub date: NaiveDate,
}

pub fn snapshot_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}-updateAt{}.json", date.format(DATE_FORMAT))
}

fn name_pattern(prefix: &str) -> Result<Regex, SnapshotError> {
    if prefix.is_empty() || prefix.contains(['/', '\\']) {
        return Err(SnapshotError::InvalidPrefix(prefix.to_string()));
    }
    Regex::new(&format!(r"^{}-updateAt(\d{{8}})\.json$", regex::escape(prefix)))
        .map_err(|_| SnapshotError::InvalidPrefix(prefix.to_string()))
}

/// Snapshots for `prefix` in `dir`, newest first. A missing directory has none.
pub fn list_snapshots(dir: &Path, prefix: &str) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let pattern = name_pattern(prefix)?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir)(err)),
    };

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(captures) = pattern.captures(name) else {
            continue;
        };
        match NaiveDate::parse_from_str(&captures[1], DATE_FORMAT) {
            Ok(date) => snapshots.push(SnapshotEntry {
                path: entry.path(),
                date,
            }),
            Err(_) => warn!(file = name, "ignoring snapshot with an impossible date"),
        }
    }
    snapshots.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(snapshots)
}

pub fn latest_snapshot(dir: &Path, prefix: &str) -> Result<Option<SnapshotEntry>, SnapshotError> {
    Ok(list_snapshots(dir, prefix)?.into_iter().next())
}

pub fn load_records(path: &Path) -> Result<Vec<RawRecord>, SnapshotError> {
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&raw).map_err(|source| SnapshotError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Records from the newest snapshot, or nothing when there is none yet.
pub fn load_latest(dir: &Path, prefix: &str) -> Result<Vec<RawRecord>, SnapshotError> {
    match latest_snapshot(dir, prefix)? {
        Some(entry) => {
            let records = load_records(&entry.path)?;
            debug!(path = %entry.path.display(), records = records.len(), "loaded snapshot");
            Ok(records)
        }
        None => Ok(Vec::new()),
    }
}

/// Write `{prefix}-updateAt{date}.json` atomically, then remove older snapshots for the prefix.
pub fn write_snapshot(
    dir: &Path,
    prefix: &str,
    date: NaiveDate,
    records: &[RawRecord],
) -> Result<PathBuf, SnapshotError> {
    name_pattern(prefix)?;
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let path = dir.join(snapshot_file_name(prefix, date));
    let serialized = serde_json::to_string_pretty(records)?;
    let temp_path = build_temp_path(&path);
    fs::write(&temp_path, format!("{serialized}\n")).map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, &path).map_err(io_error(&path))?;
    info!(path = %path.display(), records = records.len(), "wrote snapshot");

    for stale in list_snapshots(dir, prefix)? {
        if stale.path == path {
            continue;
        }
        match fs::remove_file(&stale.path) {
            Ok(()) => debug!(path = %stale.path.display(), "removed old snapshot"),
            Err(err) => warn!(path = %stale.path.display(), error = %err, "failed to remove old snapshot"),
        }
    }
    Ok(path)
}

fn build_temp_path(path: &Path) -> PathBuf {
    let mut temp_path = path.to_path_buf();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => {
            temp_path.set_extension(format!("{ext}.tmp"));
        }
        _ => {
            temp_path.set_extension("tmp");
        }
    }
    temp_path
}
