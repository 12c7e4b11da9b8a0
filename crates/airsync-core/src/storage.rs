use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, DEFAULT_CACHE_CONTROL, StorageSettings, require};

/// S3 refuses more than this many keys per DeleteObjects call.
pub const DELETE_BATCH: usize = 1_000;
const LOCAL_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("object key {0:?} is not a valid relative key")]
    InvalidKey(String),
    #[error("S3 {operation} failed: {message}")]
    S3 {
        operation: &'static str,
        message: String,
    },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("background task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next: Option<String>,
}

/// Owned object storage the rehoster uploads into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// One page of keys under `prefix`; pass the previous page's `next` to continue.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError>;

    /// Delete the given keys, returning how many were removed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError>;

    fn public_url(&self, key: &str) -> String;

    /// Key for a URL this store produced, if it produced it.
    fn key_for_url(&self, url: &str) -> Option<String> {
        let base = self.public_url("");
        let rest = url.strip_prefix(&base)?;
        let path = rest.split(['?', '#']).next().unwrap_or_default();
        let decoded = urlencoding::decode(path).ok()?;
        (!decoded.is_empty()).then(|| decoded.into_owned())
    }

    fn owns_url(&self, url: &str) -> bool {
        self.key_for_url(url).is_some()
    }
}

/// Follow continuation tokens until the listing is exhausted.
pub async fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    let mut token = None;
    let mut pages = 0usize;
    loop {
        let page = store.list_page(prefix, token).await?;
        pages += 1;
        keys.extend(page.keys);
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    debug!(prefix, pages, keys = keys.len(), "listed storage prefix");
    Ok(keys)
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct S3Store {
    client: Client,
    bucket: String,
    public_base: String,
    cache_control: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, public_base: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
        }
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = cache_control.into();
        self
    }

    /// Build a client from the ambient AWS configuration plus our overrides.
    pub async fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        let bucket = require(&settings.bucket, "AIRSYNC_BUCKET")?.to_string();
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = settings.endpoint.as_deref() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let public_base = match (&settings.cdn_base_url, &settings.endpoint) {
            (Some(cdn), _) => cdn.clone(),
            (None, Some(endpoint)) => format!("{}/{bucket}", endpoint.trim_end_matches('/')),
            (None, None) => {
                let region = shared
                    .region()
                    .map(|region| region.to_string())
                    .unwrap_or_else(|| "us-east-1".to_string());
                format!("https://{bucket}.s3.{region}.amazonaws.com")
            }
        };
        info!(bucket, public_base, "configured S3 storage");

        Ok(Self::new(client, bucket, public_base).with_cache_control(settings.cache_control.clone()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .cache_control(&self.cache_control)
            .send()
            .await
            .map_err(|err| StorageError::S3 {
                operation: "PutObject",
                message: DisplayErrorContext(&err).to_string(),
            })?;
        debug!(key, size, content_type, "uploaded object");
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError> {
        let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
        if let Some(token) = continuation {
            request = request.continuation_token(token);
        }
        let response = request.send().await.map_err(|err| StorageError::S3 {
            operation: "ListObjectsV2",
            message: DisplayErrorContext(&err).to_string(),
        })?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter(|key| !key.ends_with('/'))
            .map(str::to_string)
            .collect();
        let next = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| StorageError::S3 {
                    operation: "DeleteObjects",
                    message: err.to_string(),
                })?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|err| StorageError::S3 {
                    operation: "DeleteObjects",
                    message: err.to_string(),
                })?;
            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| StorageError::S3 {
                    operation: "DeleteObjects",
                    message: DisplayErrorContext(&err).to_string(),
                })?;
            deleted += chunk.len() - response.errors().len();
        }
        Ok(deleted)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, encode_key(key))
    }
}

/// Filesystem-backed store for dry runs and tests.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    public_base: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let public_base = format!("file://{}", root.display());
        Self { root, public_base }
    }

    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<(), StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(dir)(err)),
    };
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }
        tokio::fs::write(&path, body).await.map_err(io_error(&path))?;
        debug!(key, content_type, "stored object locally");
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError> {
        let root = self.root.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&root, &root, &mut keys).map(|_| keys)
        })
        .await
        .map_err(|err| StorageError::Join(err.to_string()))??;

        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        if let Some(after) = continuation.as_deref() {
            keys.retain(|key| key.as_str() > after);
        }

        let next = (keys.len() > LOCAL_PAGE_SIZE).then(|| keys[LOCAL_PAGE_SIZE - 1].clone());
        keys.truncate(LOCAL_PAGE_SIZE);
        Ok(ListPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path)(err)),
            }
        }
        Ok(deleted)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, encode_key(key))
    }
}
