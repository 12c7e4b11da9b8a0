use serde::Serialize;

use super::contents::{GuideStep, guide_steps};
use super::{FieldReader, TransformError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartEntity {
    pub title: String,
    pub challenge: String,
    pub day: u32,
    pub active_guide: Vec<GuideStep>,
    pub checklist: Vec<String>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<PartEntity, TransformError> {
    Ok(PartEntity {
        title: reader.required_text("title")?,
        challenge: reader.required_text("challenge")?,
        day: reader.required_count("day")?,
        active_guide: guide_steps(reader),
        checklist: reader.lines("checklist"),
    })
}
