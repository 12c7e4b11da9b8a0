use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use super::MediaError;

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub enum Download {
    Complete(DownloadedMedia),
    /// The body exceeded the configured limit; `size` is what was known when we stopped.
    TooLarge { size: u64 },
}

impl DownloadedMedia {
    pub fn is_video(&self) -> bool {
        self.content_type.starts_with("video/")
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// Download a URL into memory, stopping early once `max_bytes` is exceeded.
pub async fn download(
    client: &Client,
    url: &str,
    max_bytes: Option<u64>,
) -> Result<Download, MediaError> {
    let response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|source| MediaError::Download {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(MediaError::Status {
            url: url.to_string(),
            status,
        });
    }

    if let (Some(limit), Some(length)) = (max_bytes, response.content_length()) {
        if length > limit {
            return Ok(Download::TooLarge { size: length });
        }
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != "application/octet-stream")
        .unwrap_or_else(|| guess_content_type(url).to_string());

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| MediaError::Download {
            url: url.to_string(),
            source,
        })?;
        bytes.extend_from_slice(&chunk);
        if let Some(limit) = max_bytes {
            if bytes.len() as u64 > limit {
                return Ok(Download::TooLarge {
                    size: bytes.len() as u64,
                });
            }
        }
    }

    Ok(Download::Complete(DownloadedMedia {
        bytes,
        content_type,
    }))
}

/// Content type from a file name or URL extension.
pub fn guess_content_type(name: &str) -> &'static str {
    let path = name.split(['?', '#']).next().unwrap_or_default();
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

pub fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        "audio/mpeg" => Some("mp3"),
        _ => None,
    }
}
