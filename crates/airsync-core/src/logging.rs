use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::time::{LocalTime, UtcTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::config_directory;

const LOG_FILE_NAME: &str = "airsync.log";

/// Controls where structured logs are published.
#[derive(Debug, Clone, Copy)]
pub enum LoggingDestination {
    /// JSON lines to the persistent log file plus human-readable stderr.
    FileAndStderr,
    /// Human-readable stderr only (tests, dry runs).
    StderrOnly,
}

#[derive(Debug)]
struct LoggingGuards {
    _guard: Option<WorkerGuard>,
    log_path: Option<PathBuf>,
}

static LOGGING_STATE: OnceLock<LoggingGuards> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to prepare log directory: {0}")]
    Io(#[from] io::Error),
    #[error("invalid logging filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install logging subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. The first call wins; later calls return the same log path.
pub fn init_logging(
    destination: LoggingDestination,
) -> Result<Option<&'static PathBuf>, LoggingError> {
    if LOGGING_STATE.get().is_none() {
        let guards = install_logging(destination)?;
        if let Err(guards) = LOGGING_STATE.set(guards) {
            drop(guards);
        }
    }

    Ok(LOGGING_STATE
        .get()
        .and_then(|guards| guards.log_path.as_ref()))
}

fn install_logging(destination: LoggingDestination) -> Result<LoggingGuards, LoggingError> {
    let filter = build_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(
            tracing_subscriber::fmt::format()
                .with_timer(LocalTime::rfc_3339())
                .with_level(true)
                .with_target(true)
                .with_ansi(false),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .boxed();

    let (file_layer, guard, log_path) = match destination {
        LoggingDestination::FileAndStderr => {
            let (file_appender, path) = log_file_appender(&config_directory().join("logs"))?;
            let (writer, worker_guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .event_format(
                    tracing_subscriber::fmt::format()
                        .json()
                        .with_timer(UtcTime::rfc_3339())
                        .with_level(true)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with_writer(writer)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(worker_guard), Some(path))
        }
        LoggingDestination::StderrOnly => (None, None, None),
    };

    registry.with(file_layer).with(stderr_layer).try_init()?;

    if let Some(path) = log_path.as_ref() {
        info!(path = %path.display(), "Structured logging enabled");
    }

    Ok(LoggingGuards {
        _guard: guard,
        log_path,
    })
}

/// Single non-rotating log file; the returned path is the file actually written.
fn log_file_appender(dir: &Path) -> Result<(RollingFileAppender, PathBuf), LoggingError> {
    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    Ok((appender, dir.join(LOG_FILE_NAME)))
}

fn build_filter() -> Result<EnvFilter, ParseError> {
    if let Ok(spec) = env::var("AIRSYNC_LOG") {
        if !spec.trim().is_empty() {
            return EnvFilter::try_new(spec);
        }
    }

    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new("info"),
    }
}

/// Logs BEGIN/END lines with elapsed times for the stages of one job.
#[derive(Debug)]
pub struct StageLogger {
    job: String,
    job_start: Instant,
    stage_start: Instant,
    current_stage: Option<&'static str>,
}

impl StageLogger {
    pub fn new(job: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            job: job.into(),
            job_start: now,
            stage_start: now,
            current_stage: None,
        }
    }

    pub fn begin(&mut self, stage: &'static str) {
        if let Some(previous) = self.current_stage {
            self.end_stage(previous);
        }
        info!(
            job = %self.job,
            elapsed_ms = %format_ms(self.job_start.elapsed()),
            "BEGIN: {stage}"
        );
        self.stage_start = Instant::now();
        self.current_stage = Some(stage);
    }

    pub fn end(&mut self) {
        if let Some(stage) = self.current_stage {
            self.end_stage(stage);
        }
    }

    fn end_stage(&mut self, stage: &'static str) {
        info!(
            job = %self.job,
            elapsed_ms = %format_ms(self.job_start.elapsed()),
            stage_ms = %format_ms(self.stage_start.elapsed()),
            "END: {stage}"
        );
        self.current_stage = None;
    }

    pub fn current(&self) -> Option<&'static str> {
        self.current_stage
    }
}

fn format_ms(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64() * 1_000.0)
}
