use serde::Serialize;

use crate::record::{Attachment, Tier};

/// Substitution order used when a tier has no thumbnail of its own.
const TIER_FALLBACKS: [(Tier, [Tier; 4]); 4] = [
    (Tier::Tiny, [Tier::Tiny, Tier::Small, Tier::Medium, Tier::Large]),
    (Tier::Small, [Tier::Small, Tier::Medium, Tier::Tiny, Tier::Large]),
    (Tier::Medium, [Tier::Medium, Tier::Large, Tier::Small, Tier::Tiny]),
    (Tier::Large, [Tier::Large, Tier::Medium, Tier::Small, Tier::Tiny]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailSet {
    pub tiny: String,
    pub small: String,
    pub medium: String,
    pub large: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlock {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub default_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aos_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ios_url: Option<String>,
    pub thumbnail: ThumbnailSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Aos,
    Ios,
}

fn platform_of(attachment: &Attachment) -> Option<Platform> {
    let name = attachment.file_name().to_ascii_lowercase();
    if name.contains("aos") {
        Some(Platform::Aos)
    } else if name.contains("ios") {
        Some(Platform::Ios)
    } else {
        None
    }
}

/// Fold an attachment list into a single media block.
///
/// Attachments whose file name mentions `aos`/`ios` fill the platform slots;
/// the first remaining attachment (or the first attachment overall) is the default.
pub fn fold_media(attachments: &[Attachment]) -> Option<MediaBlock> {
    let first = attachments.first()?;

    let mut aos_url = None;
    let mut ios_url = None;
    let mut primary = None;
    for attachment in attachments {
        match platform_of(attachment) {
            Some(Platform::Aos) if aos_url.is_none() => aos_url = Some(attachment.url.clone()),
            Some(Platform::Ios) if ios_url.is_none() => ios_url = Some(attachment.url.clone()),
            None if primary.is_none() => primary = Some(attachment),
            _ => {}
        }
    }
    let primary = primary.unwrap_or(first);

    Some(MediaBlock {
        kind: media_kind(primary),
        default_url: primary.url.clone(),
        sound: None,
        aos_url,
        ios_url,
        thumbnail: fold_thumbnails(primary),
    })
}

/// Fill all four tiers, substituting the nearest available size.
pub fn fold_thumbnails(attachment: &Attachment) -> ThumbnailSet {
    let pick = |tier: Tier| -> String {
        TIER_FALLBACKS
            .iter()
            .find(|(target, _)| *target == tier)
            .and_then(|(_, order)| order.iter().find_map(|t| tier_url(attachment, *t)))
            .unwrap_or(attachment.url.as_str())
            .to_string()
    };

    ThumbnailSet {
        tiny: pick(Tier::Tiny),
        small: pick(Tier::Small),
        medium: pick(Tier::Medium),
        large: pick(Tier::Large),
    }
}

fn tier_url(attachment: &Attachment, tier: Tier) -> Option<&str> {
    match tier {
        Tier::Large => attachment
            .thumbnail_url("large")
            .or_else(|| attachment.thumbnail_url("full")),
        other => attachment.thumbnail_url(other.as_str()),
    }
}

fn media_kind(attachment: &Attachment) -> MediaKind {
    let mime = attachment.mime_type.as_deref().unwrap_or_default();
    if mime.starts_with("image/") {
        return MediaKind::Image;
    }
    if mime.starts_with("video/") {
        return MediaKind::Video;
    }
    if mime.starts_with("audio/") {
        return MediaKind::Audio;
    }

    let name = attachment.file_name().to_ascii_lowercase();
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "heic") => MediaKind::Image,
        Some("mp4" | "mov" | "m4v" | "webm") => MediaKind::Video,
        Some("mp3" | "m4a" | "wav" | "aac" | "ogg") => MediaKind::Audio,
        _ => MediaKind::File,
    }
}
