//! Media rehosting: download an attachment, optionally resize or transcode it,
//! upload it to owned storage and hand back the public URL.

pub mod fetch;
pub mod probe;
pub mod transcode;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::record::{Attachment, RawRecord, Thumbnail, Tier};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::storage::{ObjectStore, StorageError};

use fetch::{Download, DownloadedMedia};
pub use transcode::VideoTarget;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("transcode failed: {0}")]
    Transcode(String),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RehostOptions {
    /// Files larger than this are left where they are.
    pub max_bytes: Option<u64>,
    pub image_tiers: Vec<Tier>,
    pub video: Option<VideoTarget>,
    pub probe_dimensions: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehostOutcome {
    pub location: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub content_type: Option<String>,
    pub variants: BTreeMap<Tier, String>,
    pub skipped: bool,
    pub failed: bool,
}

impl RehostOutcome {
    fn passthrough(source_url: &str) -> Self {
        Self {
            location: source_url.to_string(),
            ..Self::default()
        }
    }
}

/// A record after every attachment has been through the rehoster.
#[derive(Debug, Clone)]
pub struct RehostedRecord {
    pub record: RawRecord,
    pub uploaded: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
}

impl RehostedRecord {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct MediaRehoster {
    client: Client,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    ffmpeg: String,
    ffprobe: String,
}

impl MediaRehoster {
    pub fn new(client: Client, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            client,
            store,
            retry: RetryPolicy::default(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tools(mut self, ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    /// HTTP client for media downloads. Certificate checks stay on unless explicitly disabled.
    pub fn build_client(insecure_tls: bool) -> Result<Client, MediaError> {
        let mut builder = Client::builder()
            .user_agent(concat!("airsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT);
        if insecure_tls {
            warn!("TLS certificate validation is disabled for media downloads");
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build().map_err(MediaError::Client)
    }

    /// Copy `source_url` into storage at `destination_key`, retrying transient failures.
    pub async fn upload_from_url(
        &self,
        source_url: &str,
        destination_key: &str,
        options: &RehostOptions,
    ) -> Result<RehostOutcome, MediaError> {
        let label = format!("rehost {destination_key}");
        let mut outcome = retry_with_backoff(&label, &self.retry, || {
            self.rehost_once(source_url, destination_key, options)
        })
        .await?;

        if options.probe_dimensions && !outcome.skipped {
            self.enrich_dimensions(&mut outcome).await;
        }
        Ok(outcome)
    }

    async fn rehost_once(
        &self,
        source_url: &str,
        destination_key: &str,
        options: &RehostOptions,
    ) -> Result<RehostOutcome, MediaError> {
        let media = match fetch::download(&self.client, source_url, options.max_bytes).await? {
            Download::Complete(media) => media,
            Download::TooLarge { size } => {
                info!(
                    source_url,
                    size,
                    limit = options.max_bytes,
                    "media exceeds size limit, keeping original URL"
                );
                return Ok(RehostOutcome {
                    skipped: true,
                    ..RehostOutcome::passthrough(source_url)
                });
            }
        };

        let (stem, extension) = split_extension(destination_key);
        match options.video {
            Some(target) if media.is_video() => {
                let source_extension = extension
                    .or_else(|| fetch::extension_for(&media.content_type))
                    .unwrap_or("mp4");
                let encoded =
                    transcode::transcode_video(&self.ffmpeg, &media.bytes, source_extension, &target)
                        .await?;
                let key = format!("{stem}.mp4");
                self.store.put(&key, encoded, "video/mp4").await?;
                Ok(RehostOutcome {
                    location: self.store.public_url(&key),
                    content_type: Some("video/mp4".to_string()),
                    ..RehostOutcome::default()
                })
            }
            _ => self.upload_original(destination_key, stem, media, options).await,
        }
    }

    async fn upload_original(
        &self,
        key: &str,
        stem: &str,
        media: DownloadedMedia,
        options: &RehostOptions,
    ) -> Result<RehostOutcome, MediaError> {
        let resize = media.is_image() && !options.image_tiers.is_empty();
        let bytes = if resize { media.bytes.clone() } else { Vec::new() };

        self.store.put(key, media.bytes, &media.content_type).await?;
        let mut outcome = RehostOutcome {
            location: self.store.public_url(key),
            content_type: Some(media.content_type),
            ..RehostOutcome::default()
        };

        if resize {
            let resized = transcode::resize_tiers(bytes, options.image_tiers.clone()).await?;
            for variant in resized {
                let variant_key = format!("{stem}_{}.{}", variant.tier, variant.extension);
                self.store
                    .put(&variant_key, variant.bytes, variant.content_type)
                    .await?;
                outcome
                    .variants
                    .insert(variant.tier, self.store.public_url(&variant_key));
            }
        }
        Ok(outcome)
    }

    async fn enrich_dimensions(&self, outcome: &mut RehostOutcome) {
        match probe::probe_dimensions(&self.client, &self.ffprobe, &outcome.location).await {
            Some((width, height)) => {
                outcome.location = probe::with_dimensions(&outcome.location, width, height);
                outcome.width = Some(width);
                outcome.height = Some(height);
            }
            None => warn!(location = %outcome.location, "could not determine media dimensions"),
        }
    }

    /// Rehost every attachment of a record, rewriting URLs in place.
    ///
    /// Attachments already on our storage are left alone. A failed attachment keeps
    /// its original URL and is reported in `failures`.
    pub async fn rehost_record(
        &self,
        record: &RawRecord,
        main_key: &str,
        options: &RehostOptions,
    ) -> RehostedRecord {
        let mut rehosted = RehostedRecord {
            record: record.clone(),
            uploaded: 0,
            skipped: 0,
            failures: Vec::new(),
        };

        let mut used_keys: HashSet<String> = record
            .attachment_columns()
            .iter()
            .flat_map(|column| record.attachments(column))
            .filter_map(|attachment| self.store.key_for_url(&attachment.url))
            .collect();

        for column in record.attachment_columns() {
            let Some(Value::Array(items)) = record.fields.get(&column) else {
                continue;
            };
            let mut rewritten = Vec::with_capacity(items.len());
            for item in items {
                let mut attachment: Attachment = match serde_json::from_value(item.clone()) {
                    Ok(attachment) => attachment,
                    Err(err) => {
                        warn!(record = %record.id, column = %column, error = %err, "unreadable attachment left as is");
                        rewritten.push(item.clone());
                        continue;
                    }
                };
                if self.store.owns_url(&attachment.url) {
                    rewritten.push(item.clone());
                    continue;
                }
                let key = unique_key(
                    &mut used_keys,
                    format!("{main_key}/{}", sanitize_file_name(&attachment.file_name())),
                );
                match self.upload_from_url(&attachment.url, &key, options).await {
                    Ok(outcome) if outcome.skipped => rehosted.skipped += 1,
                    Ok(outcome) => {
                        apply_outcome(&mut attachment, outcome);
                        rehosted.uploaded += 1;
                    }
                    Err(err) => {
                        warn!(record = %record.id, column = %column, error = %err, "attachment rehost failed");
                        rehosted.failures.push(format!("{column}: {err}"));
                    }
                }
                rewritten.push(serde_json::to_value(&attachment).unwrap_or_else(|_| item.clone()));
            }
            rehosted.record.fields.insert(column, Value::Array(rewritten));
        }
        rehosted
    }
}

/// Point an attachment at its rehosted copy. Source thumbnails are dropped since
/// they expire; the generated tiers replace them.
fn apply_outcome(attachment: &mut Attachment, outcome: RehostOutcome) {
    attachment.url = outcome.location;
    if outcome.width.is_some() {
        attachment.width = outcome.width;
        attachment.height = outcome.height;
    }
    if let Some(content_type) = outcome.content_type {
        if content_type == "video/mp4" {
            if let Some(name) = attachment.filename.as_mut() {
                let (stem, _) = split_extension(name);
                *name = format!("{stem}.mp4");
            }
        }
        attachment.mime_type = Some(content_type);
    }
    attachment.thumbnails = outcome
        .variants
        .into_iter()
        .map(|(tier, url)| {
            (
                tier.as_str().to_string(),
                Thumbnail {
                    url,
                    width: None,
                    height: None,
                },
            )
        })
        .collect();
}

/// `key`, or `{stem}_{n}.{ext}` with the first free `n` when another attachment
/// of the same record already claimed it.
fn unique_key(used: &mut HashSet<String>, key: String) -> String {
    if used.insert(key.clone()) {
        return key;
    }
    let (stem, extension) = split_extension(&key);
    let mut n = 2;
    loop {
        let candidate = match extension {
            Some(extension) => format!("{stem}_{n}.{extension}"),
            None => format!("{stem}_{n}"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let split = file_start + dot;
            (&name[..split], Some(&name[split + 1..]))
        }
        _ => (name, None),
    }
}

/// Keep file names readable but safe as a single key segment.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '#' | '%' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_split_only_looks_at_the_file_name() {
        assert_eq!(split_extension("contents/r1/main.png"), ("contents/r1/main", Some("png")));
        assert_eq!(split_extension("a.b/c"), ("a.b/c", None));
        assert_eq!(split_extension("k/.hidden"), ("k/.hidden", None));
    }

    #[test]
    fn colliding_keys_get_a_counter() {
        let mut used = HashSet::from(["contents/r1/old.png".to_string()]);
        assert_eq!(unique_key(&mut used, "contents/r1/image.png".into()), "contents/r1/image.png");
        assert_eq!(unique_key(&mut used, "contents/r1/image.png".into()), "contents/r1/image_2.png");
        assert_eq!(unique_key(&mut used, "contents/r1/image.png".into()), "contents/r1/image_3.png");
        assert_eq!(unique_key(&mut used, "contents/r1/old.png".into()), "contents/r1/old_2.png");
        assert_eq!(unique_key(&mut used, "contents/r1/notes".into()), "contents/r1/notes");
        assert_eq!(unique_key(&mut used, "contents/r1/notes".into()), "contents/r1/notes_2");
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("메인 이미지 (1).png"), "메인_이미지_(1).png");
        assert_eq!(sanitize_file_name("a/b?c#d.png"), "a_b_c_d.png");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("  "), "file");
    }

    #[test]
    fn outcome_replaces_thumbnails_with_tiers() {
        let mut attachment: Attachment = serde_json::from_value(serde_json::json!({
            "url": "https://dl.airtable.com/a.png",
            "filename": "a.png",
            "thumbnails": { "small": { "url": "https://dl.airtable.com/s.png" } }
        }))
        .unwrap();
        let mut variants = BTreeMap::new();
        variants.insert(Tier::Tiny, "https://cdn.example.com/k/a_tiny.png".to_string());
        apply_outcome(
            &mut attachment,
            RehostOutcome {
                location: "https://cdn.example.com/k/a.png".into(),
                content_type: Some("image/png".into()),
                variants,
                ..RehostOutcome::default()
            },
        );
        assert_eq!(attachment.url, "https://cdn.example.com/k/a.png");
        assert_eq!(attachment.thumbnails.len(), 1);
        assert_eq!(
            attachment.thumbnail_url("tiny"),
            Some("https://cdn.example.com/k/a_tiny.png")
        );
    }

    #[test]
    fn transcoded_video_renames_the_file() {
        let mut attachment = Attachment::from_url("https://dl.airtable.com/clip.mov");
        attachment.filename = Some("clip.mov".into());
        apply_outcome(
            &mut attachment,
            RehostOutcome {
                location: "https://cdn.example.com/k/clip.mp4".into(),
                content_type: Some("video/mp4".into()),
                ..RehostOutcome::default()
            },
        );
        assert_eq!(attachment.filename.as_deref(), Some("clip.mp4"));
        assert_eq!(attachment.mime_type.as_deref(), Some("video/mp4"));
    }
}
