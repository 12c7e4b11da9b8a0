use serde::Serialize;

use super::media::MediaBlock;
use super::{FieldReader, TransformError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialEntity {
    pub name: String,
    pub image: MediaBlock,
    pub category: Option<String>,
    pub purchase_url: Option<String>,
    pub description: Option<String>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<MaterialEntity, TransformError> {
    Ok(MaterialEntity {
        name: reader.required_text("name")?,
        image: reader.required_media("image")?,
        category: reader.text("category"),
        purchase_url: reader
            .text("purchaseUrl")
            .filter(|url| url.starts_with("http://") || url.starts_with("https://")),
        description: reader.text("description"),
    })
}
