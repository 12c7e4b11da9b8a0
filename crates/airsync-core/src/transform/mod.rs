//! Pure per-destination transformers from [`RawRecord`] to API entities.
//!
//! A record missing a required column is rejected on its own; callers drop it
//! and carry on with the rest of the batch.

pub mod challenge;
pub mod chat;
pub mod contents;
pub mod group;
pub mod level;
pub mod material;
pub mod media;
pub mod part;
pub mod posting_guide;
pub mod world;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::columns::{ColumnMap, Destination};
use crate::record::{Attachment, RawRecord};

pub use level::normalize_level;
pub use media::{MediaBlock, ThumbnailSet, fold_media};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("record {record_id}: missing required field '{field}' (column '{column}')")]
    MissingField {
        record_id: String,
        field: &'static str,
        column: String,
    },
    #[error("record {record_id}: field '{field}' (column '{column}') {message}")]
    InvalidField {
        record_id: String,
        field: &'static str,
        column: String,
        message: String,
    },
    #[error("record {record_id}: failed to serialize entity: {message}")]
    Serialize { record_id: String, message: String },
}

/// Reads canonical fields from a record through a [`ColumnMap`].
#[derive(Debug, Clone, Copy)]
pub struct FieldReader<'a> {
    record: &'a RawRecord,
    columns: &'a ColumnMap,
}

impl<'a> FieldReader<'a> {
    pub fn new(record: &'a RawRecord, columns: &'a ColumnMap) -> Self {
        Self { record, columns }
    }

    pub fn record_id(&self) -> &str {
        &self.record.id
    }

    fn source(&self, field: &str, index: Option<usize>) -> Option<String> {
        match index {
            Some(i) => self.columns.numbered(field, i),
            None => self.columns.source(field).map(str::to_string),
        }
    }

    fn value(&self, field: &str, index: Option<usize>) -> Option<&'a Value> {
        let column = self.source(field, index)?;
        self.record.field(&column)
    }

    fn missing(&self, field: &'static str) -> TransformError {
        TransformError::MissingField {
            record_id: self.record.id.clone(),
            field,
            column: self
                .source(field, None)
                .unwrap_or_else(|| "<unmapped>".to_string()),
        }
    }

    fn invalid(&self, field: &'static str, message: impl Into<String>) -> TransformError {
        TransformError::InvalidField {
            record_id: self.record.id.clone(),
            field,
            column: self
                .source(field, None)
                .unwrap_or_else(|| "<unmapped>".to_string()),
            message: message.into(),
        }
    }

    pub fn raw(&self, field: &str) -> Option<&'a Value> {
        self.value(field, None)
    }

    pub fn text(&self, field: &str) -> Option<String> {
        self.value(field, None).and_then(value_to_text)
    }

    pub fn text_at(&self, field: &str, index: usize) -> Option<String> {
        self.value(field, Some(index)).and_then(value_to_text)
    }

    pub fn required_text(&self, field: &'static str) -> Result<String, TransformError> {
        self.text(field).ok_or_else(|| self.missing(field))
    }

    pub fn list(&self, field: &str) -> Vec<String> {
        self.value(field, None).map(value_to_list).unwrap_or_default()
    }

    pub fn list_at(&self, field: &str, index: usize) -> Vec<String> {
        self.value(field, Some(index))
            .map(value_to_list)
            .unwrap_or_default()
    }

    pub fn required_list(&self, field: &'static str) -> Result<Vec<String>, TransformError> {
        let items = self.list(field);
        if items.is_empty() {
            Err(self.missing(field))
        } else {
            Ok(items)
        }
    }

    /// Newline separated text as a list of non-empty lines.
    pub fn lines(&self, field: &str) -> Vec<String> {
        match self.value(field, None) {
            Some(Value::String(text)) => text
                .lines()
                .map(|line| line.trim().trim_start_matches(['-', '•']).trim())
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Some(other) => value_to_list(other),
            None => Vec::new(),
        }
    }

    pub fn number(&self, field: &'static str) -> Result<Option<f64>, TransformError> {
        match self.value(field, None) {
            None => Ok(None),
            Some(value) => value_to_number(value)
                .map(Some)
                .ok_or_else(|| self.invalid(field, "is not a number")),
        }
    }

    pub fn required_number(&self, field: &'static str) -> Result<f64, TransformError> {
        self.number(field)?.ok_or_else(|| self.missing(field))
    }

    /// Positive whole number, e.g. a day count.
    pub fn required_count(&self, field: &'static str) -> Result<u32, TransformError> {
        let number = self.required_number(field)?;
        if number.fract() != 0.0 || number < 0.0 || number > f64::from(u32::MAX) {
            return Err(self.invalid(field, format!("is not a whole number: {number}")));
        }
        Ok(number as u32)
    }

    pub fn flag(&self, field: &str) -> bool {
        match self.value(field, None) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(text)) => matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "y" | "1" | "o" | "공개" | "예"
            ),
            _ => false,
        }
    }

    pub fn attachments(&self, field: &str) -> Vec<Attachment> {
        self.source(field, None)
            .map(|column| self.record.attachments(&column))
            .unwrap_or_default()
    }

    pub fn attachments_at(&self, field: &str, index: usize) -> Vec<Attachment> {
        self.source(field, Some(index))
            .map(|column| self.record.attachments(&column))
            .unwrap_or_default()
    }

    pub fn media(&self, field: &str) -> Option<MediaBlock> {
        fold_media(&self.attachments(field))
    }

    pub fn required_media(&self, field: &'static str) -> Result<MediaBlock, TransformError> {
        self.media(field).ok_or_else(|| self.missing(field))
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => items.iter().find_map(value_to_text),
        _ => None,
    }
}

fn value_to_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(value_to_text).collect(),
        Value::String(text) => text
            .split([',', '\n'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        other => value_to_text(other).into_iter().collect(),
    }
}

fn value_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Array(items) if items.len() == 1 => value_to_number(&items[0]),
        _ => None,
    }
}

/// Transformer for one destination schema, parameterised by its column map.
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    columns: ColumnMap,
}

impl RecordTransformer {
    pub fn new(columns: ColumnMap) -> Self {
        Self { columns }
    }

    pub fn for_destination(destination: Destination) -> Self {
        Self::new(ColumnMap::defaults(destination))
    }

    pub fn destination(&self) -> Destination {
        self.columns.destination()
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    pub fn transform(&self, record: &RawRecord) -> Result<Value, TransformError> {
        let reader = FieldReader::new(record, &self.columns);
        match self.destination() {
            Destination::Contents => to_json(record, contents::transform(&reader)?),
            Destination::Materials => to_json(record, material::transform(&reader)?),
            Destination::PostingGuides => to_json(record, posting_guide::transform(&reader)?),
            Destination::Chats => to_json(record, chat::transform(&reader)?),
            Destination::Worlds => to_json(record, world::transform(&reader)?),
            Destination::Groups => to_json(record, group::transform(&reader)?),
            Destination::Challenges => to_json(record, challenge::transform(&reader)?),
            Destination::Parts => to_json(record, part::transform(&reader)?),
        }
    }

    /// Transform every record, logging and dropping the ones that fail.
    pub fn transform_all(&self, records: &[RawRecord]) -> (Vec<Value>, Vec<TransformError>) {
        let mut entities = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            match self.transform(record) {
                Ok(entity) => entities.push(entity),
                Err(err) => {
                    warn!(
                        destination = %self.destination(),
                        record_id = %record.id,
                        error = %err,
                        "dropping record"
                    );
                    rejected.push(err);
                }
            }
        }
        (entities, rejected)
    }
}

fn to_json<T: Serialize>(record: &RawRecord, entity: T) -> Result<Value, TransformError> {
    serde_json::to_value(entity).map_err(|err| TransformError::Serialize {
        record_id: record.id.clone(),
        message: err.to_string(),
    })
}
