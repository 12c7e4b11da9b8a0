use serde::Serialize;

use super::level::normalize_optional_level;
use super::media::MediaBlock;
use super::{FieldReader, TransformError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldEntity {
    pub name: String,
    pub description: String,
    pub thumbnail: MediaBlock,
    pub background: Option<MediaBlock>,
    pub level: u8,
    pub contents: Vec<String>,
    pub order: Option<i64>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<WorldEntity, TransformError> {
    Ok(WorldEntity {
        name: reader.required_text("name")?,
        description: reader.required_text("description")?,
        thumbnail: reader.required_media("thumbnail")?,
        background: reader.media("background"),
        level: normalize_optional_level(reader.raw("level")),
        contents: reader.list("contents"),
        order: reader.number("order")?.map(|order| order.round() as i64),
    })
}
