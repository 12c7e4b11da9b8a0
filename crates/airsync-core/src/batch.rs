//! Incremental table sync: only records whose ids are not in the newest
//! snapshot are rehosted, then everything is written to today's snapshot.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::columns::Destination;
use crate::config::{ConfigError, DEFAULT_MAX_MEDIA_MB, JobFile, JobSpec};
use crate::error::SyncError;
use crate::logging::StageLogger;
use crate::media::{MediaRehoster, RehostOptions};
use crate::record::RawRecord;
use crate::snapshot;
use crate::table::TableSource;
use crate::transform::RecordTransformer;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadExisting,
    FetchRemote,
    Diff,
    ProcessNew,
    Merge,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::LoadExisting,
        Stage::FetchRemote,
        Stage::Diff,
        Stage::ProcessNew,
        Stage::Merge,
        Stage::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LoadExisting => "load-existing",
            Stage::FetchRemote => "fetch-remote",
            Stage::Diff => "diff",
            Stage::ProcessNew => "process-new",
            Stage::Merge => "merge",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (table, prefix) pair and how its media should be treated.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub table: String,
    pub view: Option<String>,
    pub prefix: String,
    /// When set, new records must also pass this transformer to be kept.
    pub transformer: Option<RecordTransformer>,
    pub rehost: RehostOptions,
}

impl BatchJob {
    pub fn new(table: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            view: None,
            prefix: prefix.into(),
            transformer: None,
            rehost: RehostOptions::default(),
        }
    }

    pub fn from_spec(spec: &JobSpec, job_file: &JobFile) -> Result<Self, ConfigError> {
        let transformer = spec
            .destination
            .map(|destination| job_file.column_map(destination).map(RecordTransformer::new))
            .transpose()?;
        // World media is capped even when the job file sets no limit.
        let max_media_mb = spec.max_media_mb.or(match spec.destination {
            Some(Destination::Worlds) => Some(DEFAULT_MAX_MEDIA_MB),
            _ => None,
        });
        Ok(Self {
            table: spec.table.clone(),
            view: spec.view.clone(),
            prefix: spec.prefix.clone(),
            transformer,
            rehost: RehostOptions {
                max_bytes: max_media_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB)),
                image_tiers: spec.image_tiers.clone(),
                video: spec.video,
                probe_dimensions: spec.probe_dimensions,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub table: String,
    pub prefix: String,
    pub existing: usize,
    pub fetched: usize,
    pub new: usize,
    pub kept: usize,
    pub dropped: usize,
    pub total: usize,
    /// Snapshot written by this run; `None` when today's file was already current.
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug)]
pub struct JobReport {
    pub table: String,
    pub prefix: String,
    pub result: Result<BatchReport, SyncError>,
}

/// Remote records whose id is not already known, in remote order, first occurrence wins.
pub fn diff_new_records(existing: &[RawRecord], remote: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen: HashSet<String> = existing.iter().map(|record| record.id.clone()).collect();
    remote
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}

pub struct BatchDriver<'a> {
    source: &'a dyn TableSource,
    rehoster: &'a MediaRehoster,
    data_dir: PathBuf,
}

impl<'a> BatchDriver<'a> {
    pub fn new(source: &'a dyn TableSource, rehoster: &'a MediaRehoster, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            rehoster,
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn run_job(&self, job: &BatchJob, today: NaiveDate) -> Result<BatchReport, SyncError> {
        let mut stages = StageLogger::new(job.prefix.clone());
        let mut report = BatchReport {
            table: job.table.clone(),
            prefix: job.prefix.clone(),
            ..BatchReport::default()
        };

        stages.begin(Stage::LoadExisting.as_str());
        let latest = snapshot::latest_snapshot(&self.data_dir, &job.prefix)?;
        let existing = match &latest {
            Some(entry) => snapshot::load_records(&entry.path)?,
            None => Vec::new(),
        };
        report.existing = existing.len();

        stages.begin(Stage::FetchRemote.as_str());
        let remote = self.source.fetch_table(&job.table, job.view.as_deref()).await?;
        report.fetched = remote.len();

        stages.begin(Stage::Diff.as_str());
        let fresh = diff_new_records(&existing, remote);
        report.new = fresh.len();
        info!(
            prefix = %job.prefix,
            existing = report.existing,
            fetched = report.fetched,
            new = report.new,
            "computed new records"
        );

        stages.begin(Stage::ProcessNew.as_str());
        let mut processed = Vec::with_capacity(fresh.len());
        for record in &fresh {
            if let Some(record) = self.process_record(job, record).await {
                processed.push(record);
            }
        }
        report.kept = processed.len();
        report.dropped = report.new - report.kept;

        stages.begin(Stage::Merge.as_str());
        let already_current = latest.as_ref().is_some_and(|entry| entry.date == today);
        let unchanged = processed.is_empty() && already_current;
        let mut merged = existing;
        merged.extend(processed);
        report.total = merged.len();

        stages.begin(Stage::Persist.as_str());
        if unchanged {
            info!(prefix = %job.prefix, "no new records, snapshot already current");
        } else {
            let path = snapshot::write_snapshot(&self.data_dir, &job.prefix, today, &merged)?;
            report.snapshot = Some(path);
        }
        stages.end();

        Ok(report)
    }

    /// Validate and rehost one new record; `None` means it was dropped.
    async fn process_record(&self, job: &BatchJob, record: &RawRecord) -> Option<RawRecord> {
        if let Some(transformer) = &job.transformer {
            if let Err(err) = transformer.transform(record) {
                warn!(prefix = %job.prefix, record_id = %record.id, error = %err, "dropping invalid record");
                return None;
            }
        }

        let main_key = format!("{}/{}", job.prefix, record.id);
        let rehosted = self.rehoster.rehost_record(record, &main_key, &job.rehost).await;
        if !rehosted.is_complete() {
            warn!(
                prefix = %job.prefix,
                record_id = %record.id,
                failures = ?rehosted.failures,
                "dropping record with media that could not be rehosted"
            );
            return None;
        }
        Some(rehosted.record)
    }

    /// Run several jobs; a failing job is logged and does not stop the rest.
    pub async fn run_jobs(&self, jobs: &[BatchJob], today: NaiveDate) -> Vec<JobReport> {
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.run_job(job, today).await;
            if let Err(err) = &result {
                error!(table = %job.table, prefix = %job.prefix, error = %err, "job failed");
            }
            reports.push(JobReport {
                table: job.table.clone(),
                prefix: job.prefix.clone(),
                result,
            });
        }
        reports
    }
}
