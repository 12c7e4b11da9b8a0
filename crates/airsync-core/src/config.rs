use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::config_dir;
use serde::Deserialize;
use thiserror::Error;

use crate::columns::{ColumnMap, Destination};
use crate::media::VideoTarget;
use crate::record::Tier;
use crate::retry::RetryPolicy;

const CONFIG_DIR_NAME: &str = "airsync";

pub const DEFAULT_AIRTABLE_ENDPOINT: &str = "https://api.airtable.com";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_MAX_MEDIA_MB: u64 = 150;
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: String, message: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown field '{field}' in column overrides for {destination}")]
    UnknownColumn { destination: String, field: String },
    #[error("unknown destination '{0}'")]
    UnknownDestination(String),
}

#[derive(Debug, Clone)]
pub struct AirtableSettings {
    pub api_key: Option<String>,
    pub base_id: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub cdn_base_url: Option<String>,
    pub cache_control: String,
}

#[derive(Debug, Clone)]
pub struct MongoSettings {
    pub uri: Option<String>,
    pub database: String,
}

/// Flat settings resolved from the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub airtable: AirtableSettings,
    pub storage: StorageSettings,
    pub mongodb: MongoSettings,
    pub api_base_url: Option<String>,
    pub data_dir: PathBuf,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub upload_chunk_size: usize,
    pub upload_chunk_delay_ms: u64,
    pub insecure_media_tls: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve settings through an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let airtable = AirtableSettings {
            api_key: get("AIRTABLE_API_KEY"),
            base_id: get("AIRTABLE_BASE_ID"),
            endpoint: get("AIRTABLE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_ENDPOINT.to_string()),
        };

        let storage = StorageSettings {
            bucket: get("AIRSYNC_BUCKET"),
            region: get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")),
            endpoint: get("AIRSYNC_S3_ENDPOINT"),
            cdn_base_url: get("AIRSYNC_CDN_BASE_URL"),
            cache_control: get("AIRSYNC_CACHE_CONTROL")
                .unwrap_or_else(|| DEFAULT_CACHE_CONTROL.to_string()),
        };

        let mongodb = MongoSettings {
            uri: get("AIRSYNC_MONGODB_URI"),
            database: get("AIRSYNC_MONGODB_DATABASE").unwrap_or_else(|| "airsync".to_string()),
        };

        let data_dir = expand_path(
            &get("AIRSYNC_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        );

        Ok(Self {
            airtable,
            storage,
            mongodb,
            api_base_url: get("AIRSYNC_API_BASE_URL"),
            data_dir,
            ffmpeg: get("AIRSYNC_FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe: get("AIRSYNC_FFPROBE").unwrap_or_else(|| "ffprobe".to_string()),
            max_retries: parse_env(&get, "AIRSYNC_MAX_RETRIES", 3usize, |s| s.parse())?,
            retry_base_ms: parse_env(&get, "AIRSYNC_RETRY_BASE_MS", 1_000u64, |s| s.parse())?,
            retry_cap_ms: parse_env(&get, "AIRSYNC_RETRY_CAP_MS", 30_000u64, |s| s.parse())?,
            upload_chunk_size: parse_env(&get, "AIRSYNC_UPLOAD_CHUNK_SIZE", 10usize, |s| {
                s.parse()
            })?,
            upload_chunk_delay_ms: parse_env(&get, "AIRSYNC_UPLOAD_CHUNK_DELAY_MS", 1_000u64, |s| {
                s.parse()
            })?,
            insecure_media_tls: parse_env(&get, "AIRSYNC_INSECURE_MEDIA_TLS", false, parse_bool)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_cap_ms.max(self.retry_base_ms)),
        }
    }
}

/// Return the value of a setting or a [`ConfigError::Missing`] naming its variable.
pub fn require<'a>(value: &'a Option<String>, var: &'static str) -> Result<&'a str, ConfigError> {
    value.as_deref().ok_or(ConfigError::Missing(var))
}

fn parse_env<G, T, P, E>(get: &G, var: &str, default: T, mut parser: P) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    P: FnMut(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    match get(var) {
        Some(value) => parser(&value).map_err(|err| ConfigError::Invalid {
            var: var.to_string(),
            message: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

pub fn config_directory() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// TOML job file: the tables to sync and optional column overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub columns: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub table: String,
    #[serde(default)]
    pub view: Option<String>,
    pub prefix: String,
    #[serde(default)]
    pub destination: Option<Destination>,
    #[serde(default)]
    pub max_media_mb: Option<u64>,
    #[serde(default)]
    pub image_tiers: Vec<Tier>,
    #[serde(default)]
    pub video: Option<VideoTarget>,
    #[serde(default)]
    pub probe_dimensions: bool,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn job(&self, prefix: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|job| job.prefix == prefix)
    }

    /// Column map for a destination with this file's overrides applied.
    pub fn column_map(&self, destination: Destination) -> Result<ColumnMap, ConfigError> {
        match self.columns.get(destination.as_str()) {
            Some(overrides) => ColumnMap::with_overrides(destination, overrides),
            None => Ok(ColumnMap::defaults(destination)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.airtable.endpoint, DEFAULT_AIRTABLE_ENDPOINT);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.upload_chunk_size, 10);
        assert!(!settings.insecure_media_tls);
        assert_eq!(settings.storage.cache_control, DEFAULT_CACHE_CONTROL);

        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_variable() {
        let err = Settings::from_lookup(lookup(&[("AIRSYNC_MAX_RETRIES", "many")])).unwrap_err();
        match err {
            ConfigError::Invalid { var, .. } => assert_eq!(var, "AIRSYNC_MAX_RETRIES"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blank_values_count_as_unset() {
        let settings = Settings::from_lookup(lookup(&[
            ("AIRTABLE_API_KEY", "  "),
            ("AIRSYNC_INSECURE_MEDIA_TLS", "yes"),
        ]))
        .unwrap();
        assert!(settings.airtable.api_key.is_none());
        assert!(settings.insecure_media_tls);
        assert!(matches!(
            require(&settings.airtable.api_key, "AIRTABLE_API_KEY"),
            Err(ConfigError::Missing("AIRTABLE_API_KEY"))
        ));
    }

    #[test]
    fn job_file_parses_jobs_and_overrides() {
        let raw = r#"
            [[jobs]]
            table = "콘텐츠"
            view = "Grid view"
            prefix = "contents"
            destination = "contents"
            image_tiers = ["small", "large"]

            [[jobs]]
            table = "월드"
            prefix = "worlds"
            destination = "worlds"
            max_media_mb = 150
            probe_dimensions = true

            [columns.contents]
            title = "*활동 타이틀"
        "#;
        let file = JobFile::parse(raw).unwrap();
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].image_tiers, vec![Tier::Small, Tier::Large]);
        assert_eq!(file.job("worlds").unwrap().max_media_mb, Some(150));

        let map = file.column_map(Destination::Contents).unwrap();
        assert_eq!(map.source("title"), Some("*활동 타이틀"));
        assert_eq!(map.source("categoryMain"), Some("*메인 장르"));
    }

    #[test]
    fn unknown_override_fields_are_rejected() {
        let file = JobFile::parse("[columns.materials]\nnope = \"x\"\n").unwrap();
        assert!(matches!(
            file.column_map(Destination::Materials),
            Err(ConfigError::UnknownColumn { .. })
        ));
    }
}
