use std::io::Cursor;
use std::time::Duration;

use image::ImageReader;
use reqwest::Client;
use reqwest::header::RANGE;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::MediaError;
use super::fetch::DOWNLOAD_TIMEOUT;

pub const HEADER_PROBE_BYTES: u64 = 64 * 1024;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Width and height of a hosted media file, trying the cheapest probe first.
///
/// 1. ranged request for the first 64 KiB and a header-only image decode
/// 2. full download and image decode
/// 3. full download and `ffprobe`
///
/// Every failure is swallowed; `None` means no probe could tell.
pub async fn probe_dimensions(client: &Client, ffprobe: &str, url: &str) -> Option<(u32, u32)> {
    probe_within(client, ffprobe, url, PROBE_TIMEOUT).await
}

async fn probe_within(client: &Client, ffprobe: &str, url: &str, timeout: Duration) -> Option<(u32, u32)> {
    match fetch_prefix(client, url, timeout).await {
        Ok(prefix) => {
            if let Some(dimensions) = image_dimensions(&prefix) {
                return Some(dimensions);
            }
        }
        // Stalled host: skip the full download.
        Err(err) if err.is_timeout() => {
            debug!(url, error = %err, "ranged probe timed out");
            return None;
        }
        Err(err) => debug!(url, error = %err, "ranged probe failed"),
    }

    let body = match fetch_full(client, url).await {
        Ok(body) => body,
        Err(err) => {
            debug!(url, error = %err, "full download for probing failed");
            return None;
        }
    };
    if let Some(dimensions) = image_dimensions(&body) {
        return Some(dimensions);
    }

    match ffprobe_dimensions(ffprobe, &body).await {
        Ok(dimensions) => dimensions,
        Err(err) => {
            debug!(url, error = %err, "ffprobe failed");
            None
        }
    }
}

async fn fetch_prefix(client: &Client, url: &str, timeout: Duration) -> Result<Vec<u8>, reqwest::Error> {
    let response = client
        .get(url)
        .header(RANGE, format!("bytes=0-{}", HEADER_PROBE_BYTES - 1))
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

async fn fetch_full(client: &Client, url: &str) -> Result<Vec<u8>, reqwest::Error> {
    let response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Decode only the image header; works on truncated files.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

pub async fn ffprobe_dimensions(ffprobe: &str, bytes: &[u8]) -> Result<Option<(u32, u32)>, MediaError> {
    let scratch = tempfile::tempdir()?;
    let path = scratch.path().join("probe.bin");
    tokio::fs::write(&path, bytes).await?;

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
        ])
        .arg(&path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| MediaError::Transcode(format!("failed to spawn {ffprobe}: {err}")))?;

    if !output.status.success() {
        return Err(MediaError::Transcode(format!(
            "ffprobe exited with {}",
            output.status
        )));
    }
    Ok(parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout)))
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

pub fn parse_ffprobe_output(stdout: &str) -> Option<(u32, u32)> {
    let parsed: ProbeOutput = serde_json::from_str(stdout).ok()?;
    parsed
        .streams
        .into_iter()
        .find_map(|stream| Some((stream.width?, stream.height?)))
        .filter(|(width, height)| *width > 0 && *height > 0)
}

/// Append `width`/`height` query parameters, replacing any already present.
pub fn with_dimensions(url: &str, width: u32, height: u32) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "width" && key != "height")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("width", &width.to_string())
        .append_pair("height", &height.to_string());
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stalled_host_gives_up_instead_of_hanging() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = format!("http://{address}/media/main.png");
        let probed = tokio::time::timeout(
            Duration::from_secs(10),
            probe_within(&Client::new(), "ffprobe", &url, Duration::from_millis(200)),
        )
        .await;
        assert_eq!(probed.expect("gave up before the outer deadline"), None);
    }

    #[test]
    fn header_decode_survives_truncation() {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(320, 180))
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        let bytes = buffer.into_inner();
        assert_eq!(image_dimensions(&bytes[..64]), Some((320, 180)));
        assert_eq!(image_dimensions(b"\x00\x00\x00 ftypisom"), None);
    }

    #[test]
    fn ffprobe_json_is_parsed() {
        let stdout = r#"{ "programs": [], "streams": [ { "width": 1080, "height": 1920 } ] }"#;
        assert_eq!(parse_ffprobe_output(stdout), Some((1080, 1920)));
        assert_eq!(parse_ffprobe_output(r#"{ "streams": [] }"#), None);
        assert_eq!(parse_ffprobe_output("not json"), None);
    }

    #[test]
    fn dimensions_replace_existing_query_parameters() {
        assert_eq!(
            with_dimensions("https://cdn.example.com/a.png", 10, 20),
            "https://cdn.example.com/a.png?width=10&height=20"
        );
        assert_eq!(
            with_dimensions("https://cdn.example.com/a.png?v=2&width=1", 10, 20),
            "https://cdn.example.com/a.png?v=2&width=10&height=20"
        );
        assert_eq!(with_dimensions("not a url", 1, 1), "not a url");
    }
}
