use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::MediaError;
use crate::record::Tier;

const DEFAULT_MAX_BITRATE_KBPS: u32 = 1_500;
const STDERR_TAIL: usize = 800;

/// Output frame and bitrate cap for video re-encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTarget {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_kbps: u32,
}

fn default_max_bitrate() -> u32 {
    DEFAULT_MAX_BITRATE_KBPS
}

impl VideoTarget {
    /// Fit inside the target frame, then letterbox to its exact aspect.
    pub fn filter_graph(&self) -> String {
        let (w, h) = (self.width, self.height);
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1"
        )
    }

    pub fn ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let bitrate = format!("{}k", self.max_bitrate_kbps);
        let bufsize = format!("{}k", self.max_bitrate_kbps * 2);
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.display().to_string(),
            "-vf".into(),
            self.filter_graph(),
            "-c:v".into(),
            "libx264".into(),
            "-profile:v".into(),
            "baseline".into(),
            "-level".into(),
            "3.1".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-b:v".into(),
            bitrate.clone(),
            "-maxrate".into(),
            bitrate,
            "-bufsize".into(),
            bufsize,
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-movflags".into(),
            "+faststart".into(),
            output.display().to_string(),
        ]
    }
}

/// Re-encode a video through ffmpeg. Scratch files live in a temp dir removed on every exit path.
pub async fn transcode_video(
    ffmpeg: &str,
    input: &[u8],
    source_extension: &str,
    target: &VideoTarget,
) -> Result<Vec<u8>, MediaError> {
    let scratch = tempfile::tempdir()?;
    let input_path = scratch.path().join(format!("input.{source_extension}"));
    let output_path = scratch.path().join("output.mp4");
    tokio::fs::write(&input_path, input).await?;

    let args = target.ffmpeg_args(&input_path, &output_path);
    debug!(ffmpeg, ?args, "transcoding video");
    let output = Command::new(ffmpeg)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| MediaError::Transcode(format!("failed to spawn {ffmpeg}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr.get(tail_start..).unwrap_or(&stderr);
        return Err(MediaError::Transcode(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            tail.trim()
        )));
    }

    Ok(tokio::fs::read(&output_path).await?)
}

#[derive(Debug, Clone)]
pub struct ResizedImage {
    pub tier: Tier,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Resize an image to each tier's longest edge (never upscaling) on the blocking pool.
pub async fn resize_tiers(bytes: Vec<u8>, tiers: Vec<Tier>) -> Result<Vec<ResizedImage>, MediaError> {
    tokio::task::spawn_blocking(move || resize_tiers_blocking(&bytes, &tiers))
        .await
        .map_err(|err| MediaError::Transcode(format!("resize task failed: {err}")))?
}

pub fn resize_tiers_blocking(bytes: &[u8], tiers: &[Tier]) -> Result<Vec<ResizedImage>, MediaError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let keep_png = matches!(reader.format(), Some(ImageFormat::Png | ImageFormat::Gif));
    let image = reader.decode()?;

    tiers
        .iter()
        .map(|tier| {
            let edge = tier.max_edge();
            let resized = if image.width() <= edge && image.height() <= edge {
                image.clone()
            } else {
                image.resize(edge, edge, FilterType::Lanczos3)
            };
            encode(*tier, &resized, keep_png)
        })
        .collect()
}

fn encode(tier: Tier, image: &DynamicImage, keep_png: bool) -> Result<ResizedImage, MediaError> {
    let mut buffer = Cursor::new(Vec::new());
    let (content_type, extension) = if keep_png {
        image.write_to(&mut buffer, ImageFormat::Png)?;
        ("image/png", "png")
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buffer, ImageFormat::Jpeg)?;
        ("image/jpeg", "jpg")
    };
    Ok(ResizedImage {
        tier,
        bytes: buffer.into_inner(),
        content_type,
        extension,
        width: image.width(),
        height: image.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 80, 40]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn tiers_shrink_to_their_edge_without_upscaling() {
        let resized = resize_tiers_blocking(&png(600, 300), &[Tier::Tiny, Tier::Large]).unwrap();
        assert_eq!(resized.len(), 2);

        assert_eq!(resized[0].tier, Tier::Tiny);
        assert_eq!((resized[0].width, resized[0].height), (64, 32));
        assert_eq!(resized[0].content_type, "image/png");

        assert_eq!((resized[1].width, resized[1].height), (600, 300));
    }

    #[test]
    fn garbage_bytes_are_an_error() {
        assert!(resize_tiers_blocking(b"not an image", &[Tier::Small]).is_err());
    }

    #[test]
    fn ffmpeg_arguments_pin_codec_and_bitrate() {
        let target = VideoTarget {
            width: 720,
            height: 1280,
            max_bitrate_kbps: 1_200,
        };
        let args = target.ffmpeg_args(Path::new("/tmp/in.mov"), Path::new("/tmp/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264 -profile:v baseline"));
        assert!(joined.contains("-maxrate 1200k -bufsize 2400k"));
        assert!(joined.contains("pad=720:1280:(ow-iw)/2:(oh-ih)/2"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn video_target_defaults_bitrate_from_toml() {
        let target: VideoTarget = toml::from_str("width = 1080\nheight = 1920\n").unwrap();
        assert_eq!(target.max_bitrate_kbps, DEFAULT_MAX_BITRATE_KBPS);
    }
}
