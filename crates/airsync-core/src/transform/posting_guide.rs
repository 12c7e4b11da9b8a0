use serde::Serialize;

use super::media::MediaBlock;
use super::{FieldReader, TransformError, fold_media};

pub const MAX_POSTING_STEPS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingStep {
    pub media_url: Option<String>,
    pub guide: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingGuideEntity {
    pub title: String,
    pub content_title: String,
    pub steps: Vec<PostingStep>,
    pub example: Option<MediaBlock>,
    pub hashtags: Vec<String>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<PostingGuideEntity, TransformError> {
    let title = reader.required_text("title")?;
    let content_title = reader.required_text("contentTitle")?;

    let steps = (1..=MAX_POSTING_STEPS)
        .filter_map(|index| {
            let media_url = fold_media(&reader.attachments_at("step.image", index))
                .map(|media| media.default_url);
            let guide = reader.text_at("step.text", index);
            if media_url.is_none() && guide.is_none() {
                return None;
            }
            Some(PostingStep { media_url, guide })
        })
        .collect();

    Ok(PostingGuideEntity {
        title,
        content_title,
        steps,
        example: reader.media("example"),
        hashtags: reader
            .list("hashtags")
            .into_iter()
            .flat_map(|tag| {
                tag.split_whitespace()
                    .map(|part| format!("#{}", part.trim_start_matches('#')))
                    .collect::<Vec<_>>()
            })
            .filter(|tag| tag.len() > 1)
            .collect(),
    })
}
