use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

/// Airtable ETL: sync tables into dated snapshots, push them downstream, clean up.
#[derive(Parser, Debug, Clone)]
#[command(name = "airsync", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args, Default)]
pub struct GlobalArgs {
    /// TOML file listing the jobs and column overrides.
    #[arg(
        long = "jobs",
        global = true,
        env = "AIRSYNC_JOBS",
        value_hint = ValueHint::FilePath,
        value_name = "FILE"
    )]
    pub jobs: Option<PathBuf>,

    /// Directory holding the dated snapshot files (overrides AIRSYNC_DATA_DIR).
    #[arg(long = "data-dir", global = true, value_hint = ValueHint::DirPath, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log to stderr only instead of also writing the JSON log file.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub no_log_file: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Fetch tables, rehost media of new records and write today's snapshots.
    Sync(SyncArgs),
    /// Transform the latest snapshot of a prefix and upsert it into the API.
    Push(PushArgs),
    /// Print the transformed entities of a snapshot as JSON.
    Transform(TransformArgs),
    /// Delete storage objects under a prefix that the latest snapshot no longer references.
    CleanupStorage(CleanupArgs),
    /// Set fields on every document matching the filter.
    DbUpdate(DbUpdateArgs),
    /// Delete every document matching the filter.
    DbDelete(DbDeleteArgs),
}

#[derive(Debug, Clone, Args, Default)]
pub struct SyncArgs {
    /// Only run the jobs with these prefixes (default: every job).
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,

    /// Snapshot date to write, YYYY-MM-DD (default: today).
    #[arg(long, value_name = "DATE")]
    pub date: Option<String>,

    /// Rehost into a local directory instead of S3.
    #[arg(long, value_hint = ValueHint::DirPath, value_name = "DIR")]
    pub local_storage: Option<PathBuf>,

    /// Public URL prefix for objects in --local-storage.
    #[arg(long, requires = "local_storage", value_name = "URL")]
    pub local_base_url: Option<String>,
}

#[derive(Debug, Clone, Args, Default)]
pub struct PushArgs {
    #[arg(long, value_name = "PREFIX")]
    pub prefix: String,

    /// Destination schema (default: the job's destination, then the prefix itself).
    #[arg(long, value_name = "NAME")]
    pub destination: Option<String>,

    /// Transform and report without calling the API.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
pub struct TransformArgs {
    #[arg(long, value_name = "PREFIX")]
    pub prefix: String,

    #[arg(long, value_name = "NAME")]
    pub destination: Option<String>,

    /// Read this snapshot file instead of the latest one for the prefix.
    #[arg(long, value_hint = ValueHint::FilePath, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Write the JSON here instead of stdout.
    #[arg(short, long, value_hint = ValueHint::FilePath, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Default)]
pub struct CleanupArgs {
    /// Snapshot prefix whose records decide what stays.
    #[arg(long, value_name = "PREFIX")]
    pub prefix: String,

    /// Storage key prefix to scan (default: "<prefix>/").
    #[arg(long, value_name = "KEY_PREFIX")]
    pub storage_prefix: Option<String>,

    /// List orphans without deleting them.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
pub struct DbUpdateArgs {
    #[arg(long, value_name = "NAME")]
    pub collection: String,

    /// Filter clause, field=value (repeatable, all must match).
    #[arg(long = "where", value_name = "FIELD=VALUE", required = true)]
    pub filters: Vec<String>,

    /// Field to set, field=value (repeatable).
    #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
    pub assignments: Vec<String>,

    /// Count matching documents without changing them.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
pub struct DbDeleteArgs {
    #[arg(long, value_name = "NAME")]
    pub collection: String,

    #[arg(long = "where", value_name = "FIELD=VALUE", required = true)]
    pub filters: Vec<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}
