//! Command dispatch for the `airsync` binary.

pub mod cli_args;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use airsync_core::config::require;
use airsync_core::maintenance::{self, DocumentStore, FieldPredicate, MongoStore};
use airsync_core::push::{prepare_push, push_snapshot};
use airsync_core::snapshot;
use airsync_core::{
    AirtableClient, BatchDriver, BatchJob, Destination, JobFile, JobSpec, LocalStore, MediaRehoster,
    ObjectStore, RecordTransformer, ResourceClient, S3Store, Settings,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub use cli_args::{Cli, Command};
use cli_args::{CleanupArgs, DbDeleteArgs, DbUpdateArgs, PushArgs, SyncArgs, TransformArgs};

pub async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(dir) = cli.global.data_dir {
        settings.data_dir = dir;
    }
    let job_file = match cli.global.jobs.as_deref() {
        Some(path) => JobFile::load(path)?,
        None => JobFile::default(),
    };

    match cli.command {
        Command::Sync(args) => sync(&settings, &job_file, args).await,
        Command::Push(args) => push(&settings, &job_file, args).await,
        Command::Transform(args) => transform(&settings, &job_file, args),
        Command::CleanupStorage(args) => cleanup_storage(&settings, args).await,
        Command::DbUpdate(args) => db_update(&settings, args).await,
        Command::DbDelete(args) => db_delete(&settings, args).await,
    }
}

/// Parse `--date`, falling back to the local calendar day.
pub fn parse_snapshot_date(raw: Option<&str>) -> Result<NaiveDate> {
    match raw {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid --date {raw:?}, expected YYYY-MM-DD")),
        None => Ok(Local::now().date_naive()),
    }
}

/// Jobs to run for `sync`: all of them, or only the named prefixes in file order.
pub fn select_jobs<'a>(job_file: &'a JobFile, prefixes: &[String]) -> Result<Vec<&'a JobSpec>> {
    if job_file.jobs.is_empty() {
        bail!("no jobs configured; pass --jobs FILE or set AIRSYNC_JOBS");
    }
    if let Some(unknown) = prefixes.iter().find(|prefix| job_file.job(prefix).is_none()) {
        bail!("no job with prefix {unknown:?} in the job file");
    }
    Ok(job_file
        .jobs
        .iter()
        .filter(|job| prefixes.is_empty() || prefixes.contains(&job.prefix))
        .collect())
}

/// `--destination`, then the job's configured destination, then the prefix itself.
pub fn resolve_destination(explicit: Option<&str>, prefix: &str, job_file: &JobFile) -> Result<Destination> {
    if let Some(raw) = explicit {
        return Ok(raw.parse::<Destination>()?);
    }
    if let Some(destination) = job_file.job(prefix).and_then(|job| job.destination) {
        return Ok(destination);
    }
    prefix
        .parse()
        .map_err(|_| anyhow!("cannot tell the destination of prefix {prefix:?}; pass --destination"))
}

fn transformer_for(destination: Destination, job_file: &JobFile) -> Result<RecordTransformer> {
    Ok(RecordTransformer::new(job_file.column_map(destination)?))
}

async fn sync(settings: &Settings, job_file: &JobFile, args: SyncArgs) -> Result<()> {
    let today = parse_snapshot_date(args.date.as_deref())?;
    let jobs = select_jobs(job_file, &args.prefixes)?
        .into_iter()
        .map(|spec| BatchJob::from_spec(spec, job_file))
        .collect::<Result<Vec<_>, _>>()?;

    let store: Arc<dyn ObjectStore> = match args.local_storage {
        Some(dir) => {
            let local = LocalStore::new(dir);
            Arc::new(match args.local_base_url {
                Some(base) => local.with_public_base(base),
                None => local,
            })
        }
        None => Arc::new(S3Store::from_settings(&settings.storage).await?),
    };
    let rehoster = MediaRehoster::new(MediaRehoster::build_client(settings.insecure_media_tls)?, store)
        .with_retry(settings.retry_policy())
        .with_tools(settings.ffmpeg.clone(), settings.ffprobe.clone());
    let source = AirtableClient::from_settings(reqwest::Client::new(), &settings.airtable)?
        .with_retry(settings.retry_policy());

    info!(jobs = jobs.len(), date = %today, data_dir = %settings.data_dir.display(), "starting sync");
    let driver = BatchDriver::new(&source, &rehoster, settings.data_dir.clone());
    let reports = driver.run_jobs(&jobs, today).await;

    let mut failed = 0usize;
    for report in &reports {
        match &report.result {
            Ok(batch) => println!(
                "{}: {} new, {} kept, {} dropped, {} total{}",
                report.prefix,
                batch.new,
                batch.kept,
                batch.dropped,
                batch.total,
                batch
                    .snapshot
                    .as_ref()
                    .map(|path| format!(" -> {}", path.display()))
                    .unwrap_or_default()
            ),
            Err(err) => {
                failed += 1;
                println!("{}: failed: {err}", report.prefix);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} jobs failed", reports.len());
    }
    Ok(())
}

async fn push(settings: &Settings, job_file: &JobFile, args: PushArgs) -> Result<()> {
    let destination = resolve_destination(args.destination.as_deref(), &args.prefix, job_file)?;
    let transformer = transformer_for(destination, job_file)?;

    if args.dry_run {
        let prepared = prepare_push(&settings.data_dir, &args.prefix, &transformer)?;
        for rejected in &prepared.rejected {
            warn!(error = %rejected, "record skipped");
        }
        println!("{}", serde_json::to_string_pretty(&prepared.entities)?);
        eprintln!(
            "{} records, {} entities, {} rejected (dry run, nothing sent)",
            prepared.records,
            prepared.entities.len(),
            prepared.rejected.len()
        );
        return Ok(());
    }

    let base_url = require(&settings.api_base_url, "AIRSYNC_API_BASE_URL")?;
    let client = ResourceClient::for_destination(reqwest::Client::new(), base_url, destination).with_batching(
        settings.upload_chunk_size,
        Duration::from_millis(settings.upload_chunk_delay_ms),
    );
    let report = push_snapshot(&settings.data_dir, &args.prefix, &transformer, &client).await?;
    for rejected in &report.prepared.rejected {
        warn!(error = %rejected, "record skipped");
    }
    println!("{}", serde_json::to_string_pretty(&report.summary)?);
    if report.summary.failed > 0 {
        bail!(
            "{} of {} uploads to {} failed",
            report.summary.failed,
            report.prepared.entities.len(),
            client.resource()
        );
    }
    Ok(())
}

fn transform(settings: &Settings, job_file: &JobFile, args: TransformArgs) -> Result<()> {
    let destination = resolve_destination(args.destination.as_deref(), &args.prefix, job_file)?;
    let transformer = transformer_for(destination, job_file)?;

    let records = match args.input.as_deref() {
        Some(path) => snapshot::load_records(path)?,
        None => {
            let entry = snapshot::latest_snapshot(&settings.data_dir, &args.prefix)?.ok_or_else(|| {
                anyhow!(
                    "no snapshot for prefix {} in {}",
                    args.prefix,
                    settings.data_dir.display()
                )
            })?;
            snapshot::load_records(&entry.path)?
        }
    };

    let (entities, rejected) = transformer.transform_all(&records);
    for error in &rejected {
        warn!(error = %error, "record skipped");
    }
    let json = serde_json::to_string_pretty(&entities)?;
    match args.output.as_deref() {
        Some(path) => write_output(path, &json)?,
        None => println!("{json}"),
    }
    info!(
        destination = %destination,
        records = records.len(),
        entities = entities.len(),
        rejected = rejected.len(),
        "transform finished"
    );
    Ok(())
}

fn write_output(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, format!("{json}\n")).with_context(|| format!("writing {}", path.display()))
}

async fn cleanup_storage(settings: &Settings, args: CleanupArgs) -> Result<()> {
    let records = snapshot::load_latest(&settings.data_dir, &args.prefix)?;
    let store = S3Store::from_settings(&settings.storage).await?;
    let key_prefix = args
        .storage_prefix
        .unwrap_or_else(|| format!("{}/", args.prefix));

    let report = maintenance::cleanup_orphans(&store, &key_prefix, &records, args.dry_run).await?;
    if args.dry_run {
        for key in &report.orphans {
            println!("{key}");
        }
    }
    eprintln!(
        "{} objects listed, {} referenced, {} orphaned, {} deleted",
        report.listed,
        report.referenced,
        report.orphans.len(),
        report.deleted
    );
    Ok(())
}

/// Collect `--set field=value` pairs into a `$set` document.
pub fn parse_assignments(raw: &[String]) -> Result<Map<String, Value>> {
    let mut set = Map::new();
    for assignment in raw {
        let (field, value) = maintenance::parse_assignment(assignment)?;
        set.insert(field, value);
    }
    Ok(set)
}

async fn db_update(settings: &Settings, args: DbUpdateArgs) -> Result<()> {
    let filter = FieldPredicate::parse_all(&args.filters)?;
    let set = parse_assignments(&args.assignments)?;
    let store = MongoStore::connect(&settings.mongodb).await?;

    if args.dry_run {
        let matched = store.count(&args.collection, &filter).await?;
        println!("{matched} documents in {} would be updated", args.collection);
        return Ok(());
    }
    let modified = store.update_many(&args.collection, &filter, &set).await?;
    println!("updated {modified} documents in {}", args.collection);
    Ok(())
}

async fn db_delete(settings: &Settings, args: DbDeleteArgs) -> Result<()> {
    let filter = FieldPredicate::parse_all(&args.filters)?;
    let store = MongoStore::connect(&settings.mongodb).await?;

    if args.dry_run {
        let matched = store.count(&args.collection, &filter).await?;
        println!("{matched} documents in {} would be deleted", args.collection);
        return Ok(());
    }
    let deleted = store.delete_many(&args.collection, &filter).await?;
    println!("deleted {deleted} documents from {}", args.collection);
    Ok(())
}
