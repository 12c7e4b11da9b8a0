use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// One row from the tabular source: a stable `id` plus a flat map from
/// spreadsheet column name to value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// File attachment as delivered by the tabular source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thumbnails: BTreeMap<String, Thumbnail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Fixed thumbnail size scheme used by destination entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tiny,
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Tiny, Tier::Small, Tier::Medium, Tier::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tiny => "tiny",
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }

    /// Longest edge in pixels when an image is resized for this tier.
    pub fn max_edge(&self) -> u32 {
        match self {
            Tier::Tiny => 64,
            Tier::Small => 256,
            Tier::Medium => 512,
            Tier::Large => 1024,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Attachment {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            id: None,
            url: url.into(),
            mime_type: None,
            filename: None,
            size: None,
            width: None,
            height: None,
            thumbnails: BTreeMap::new(),
        }
    }

    /// File name from the attachment metadata, falling back to the last URL path segment.
    pub fn file_name(&self) -> String {
        if let Some(name) = self.filename.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("file")
            .to_string()
    }

    pub fn thumbnail_url(&self, name: &str) -> Option<&str> {
        self.thumbnails.get(name).map(|thumb| thumb.url.as_str())
    }
}

impl RawRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, column: impl Into<String>, value: Value) -> Self {
        self.fields.insert(column.into(), value);
        self
    }

    /// Value for a column, treating `null`, blank strings and empty arrays as absent.
    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|value| !is_blank(value))
    }

    pub fn attachments(&self, column: &str) -> Vec<Attachment> {
        match self.field(column) {
            Some(value) => parse_attachments(value),
            None => Vec::new(),
        }
    }

    /// Columns whose value is a non-empty list of attachments.
    pub fn attachment_columns(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, value)| is_attachment_list(value))
            .map(|(column, _)| column.clone())
            .collect()
    }

}

pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub fn is_attachment_list(value: &Value) -> bool {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().all(|item| {
            item.as_object()
                .and_then(|object| object.get("url"))
                .is_some_and(Value::is_string)
        }),
        _ => false,
    }
}

fn parse_attachments(value: &Value) -> Vec<Attachment> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(attachment) => Some(attachment),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable attachment");
                    None
                }
            })
            .collect(),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map(|attachment| vec![attachment])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RawRecord {
        serde_json::from_value(json!({
            "id": "rec1",
            "*액티비티 타이틀": "종이접기",
            "빈 칸": "  ",
            "*메인 이미지": [{
                "id": "att1",
                "url": "https://dl.airtable.com/a/main.png",
                "type": "image/png",
                "filename": "main.png",
                "thumbnails": {
                    "small": {"url": "https://dl.airtable.com/a/s.png", "width": 36, "height": 36},
                    "large": {"url": "https://dl.airtable.com/a/l.png"}
                }
            }],
            "태그": ["종이", "공예"]
        }))
        .unwrap()
    }

    #[test]
    fn flat_json_round_trips_through_record() {
        let record = sample();
        assert_eq!(record.id, "rec1");
        assert!(!record.fields.contains_key("id"));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "rec1");
        assert_eq!(value["*액티비티 타이틀"], "종이접기");
    }

    #[test]
    fn blank_fields_read_as_absent() {
        let record = sample();
        assert!(record.field("빈 칸").is_none());
        assert!(record.field("없는 칸").is_none());
        assert!(record.field("태그").is_some());
    }

    #[test]
    fn attachment_columns_only_include_url_lists() {
        let record = sample();
        assert_eq!(record.attachment_columns(), vec!["*메인 이미지".to_string()]);

        let attachments = record.attachments("*메인 이미지");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(
            attachments[0].thumbnail_url("small"),
            Some("https://dl.airtable.com/a/s.png")
        );
    }

    #[test]
    fn file_name_falls_back_to_url_segment() {
        let attachment = Attachment::from_url("https://cdn.example.com/media/clip.mp4?v=2");
        assert_eq!(attachment.file_name(), "clip.mp4");
    }

    #[test]
    fn unreadable_attachments_are_skipped_when_reading() {
        let record = RawRecord::new("rec1").with_field(
            "*메인 이미지",
            json!([
                { "url": "https://dl.airtable.com/a.png", "width": "wide" },
                { "url": "https://dl.airtable.com/b.png" }
            ]),
        );
        let attachments = record.attachments("*메인 이미지");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].url, "https://dl.airtable.com/b.png");
    }
}
