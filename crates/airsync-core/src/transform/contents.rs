use serde::Serialize;

use super::level::normalize_optional_level;
use super::media::MediaBlock;
use super::{FieldReader, TransformError};

pub const MAX_GUIDE_STEPS: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideStep {
    pub media_url: String,
    pub guide: Option<String>,
    pub tip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentsEntity {
    pub title: String,
    pub category_main: String,
    pub category_sub: Vec<String>,
    pub level: u8,
    pub description: String,
    pub duration: Option<u32>,
    pub main_media: MediaBlock,
    pub intro_video: Option<MediaBlock>,
    pub materials: Vec<String>,
    pub active_guide: Vec<GuideStep>,
    pub checklist: Vec<String>,
    pub tags: Vec<String>,
    pub published: bool,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<ContentsEntity, TransformError> {
    let title = reader.required_text("title")?;
    let category_main = reader.required_text("categoryMain")?;
    let description = reader.required_text("description")?;

    let mut main_media = reader.required_media("mainMedia")?;
    main_media.sound = reader.media("sound").map(|sound| sound.default_url);

    let duration = reader
        .number("duration")?
        .filter(|minutes| *minutes > 0.0)
        .map(|minutes| minutes.round() as u32);

    Ok(ContentsEntity {
        title,
        category_main,
        category_sub: reader.list("categorySub"),
        level: normalize_optional_level(reader.raw("level")),
        description,
        duration,
        main_media,
        intro_video: reader.media("introVideo"),
        materials: reader.list("materials"),
        active_guide: guide_steps(reader),
        checklist: reader.lines("checklist"),
        tags: reader.list("tags"),
        published: reader.flag("published"),
    })
}

/// Numbered guide groups in ascending order; a group counts only when its image is present.
pub fn guide_steps(reader: &FieldReader<'_>) -> Vec<GuideStep> {
    (1..=MAX_GUIDE_STEPS)
        .filter_map(|index| {
            let media = super::fold_media(&reader.attachments_at("guide.image", index))?;
            Some(GuideStep {
                media_url: media.default_url,
                guide: reader.text_at("guide.text", index),
                tip: reader.text_at("guide.tip", index),
            })
        })
        .collect()
}
