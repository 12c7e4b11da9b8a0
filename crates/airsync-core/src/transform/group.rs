use serde::Serialize;

use super::media::MediaBlock;
use super::{FieldReader, TransformError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntity {
    pub name: String,
    pub world: String,
    pub contents: Vec<String>,
    pub icon: Option<MediaBlock>,
    pub order: Option<i64>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<GroupEntity, TransformError> {
    Ok(GroupEntity {
        name: reader.required_text("name")?,
        world: reader.required_text("world")?,
        contents: reader.required_list("contents")?,
        icon: reader.media("icon"),
        order: reader.number("order")?.map(|order| order.round() as i64),
    })
}
