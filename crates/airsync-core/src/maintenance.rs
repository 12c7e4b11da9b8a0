//! Housekeeping jobs that run outside the sync pipeline: bulk edits in the
//! document store and removal of storage objects no snapshot points at.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use bson::{Bson, Document};
use mongodb::Client;
use mongodb::options::ClientOptions;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, MongoSettings, require};
use crate::record::RawRecord;
use crate::storage::{DELETE_BATCH, ObjectStore, StorageError, list_all};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid predicate {0:?}, expected field=value")]
    InvalidPredicate(String),
    #[error("refusing to touch every document in {0}; give at least one field=value")]
    EmptyPredicate(String),
    #[error("refusing to clean {0}: the snapshot references nothing")]
    EmptySnapshot(String),
    #[error("value for {field} cannot be stored: {message}")]
    Value { field: String, message: String },
    #[error("document store error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Conjunction of `field = value` equalities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPredicate {
    clauses: Vec<(String, Value)>,
}

impl FieldPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push((field.into(), value));
        self
    }

    pub fn parse_all<I, S>(raw: I) -> Result<Self, MaintenanceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut predicate = Self::new();
        for item in raw {
            let (field, value) = parse_assignment(item.as_ref())?;
            predicate.clauses.push((field, value));
        }
        Ok(predicate)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn to_document(&self) -> Result<Document, MaintenanceError> {
        to_document(self.clauses.iter().map(|(field, value)| (field.as_str(), value)))
    }
}

impl FromStr for FieldPredicate {
    type Err = MaintenanceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse_all(raw.split(',').map(str::trim).filter(|part| !part.is_empty()))
    }
}

/// `field=value`; the value is read as JSON when it parses, otherwise as a plain string.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), MaintenanceError> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| MaintenanceError::InvalidPredicate(raw.to_string()))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(MaintenanceError::InvalidPredicate(raw.to_string()));
    }
    let value = value.trim();
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

fn to_document<'a>(pairs: impl Iterator<Item = (&'a str, &'a Value)>) -> Result<Document, MaintenanceError> {
    let mut document = Document::new();
    for (field, value) in pairs {
        let bson: Bson = bson::to_bson(value).map_err(|err| MaintenanceError::Value {
            field: field.to_string(),
            message: err.to_string(),
        })?;
        document.insert(field, bson);
    }
    Ok(document)
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn count(&self, collection: &str, filter: &FieldPredicate) -> Result<u64, MaintenanceError>;

    /// `$set` the given fields on every matching document; returns the modified count.
    async fn update_many(
        &self,
        collection: &str,
        filter: &FieldPredicate,
        set: &Map<String, Value>,
    ) -> Result<u64, MaintenanceError>;

    async fn delete_many(&self, collection: &str, filter: &FieldPredicate) -> Result<u64, MaintenanceError>;
}

pub struct MongoStore {
    client: Client,
    database: String,
}

impl MongoStore {
    pub async fn connect(settings: &MongoSettings) -> Result<Self, MaintenanceError> {
        let uri = require(&settings.uri, "AIRSYNC_MONGODB_URI")?;
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some("airsync".to_owned());
        let client = Client::with_options(options)?;
        Ok(Self {
            client,
            database: settings.database.clone(),
        })
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.client.database(&self.database).collection::<Document>(name)
    }
}

fn guarded_filter(collection: &str, filter: &FieldPredicate) -> Result<Document, MaintenanceError> {
    if filter.is_empty() {
        return Err(MaintenanceError::EmptyPredicate(collection.to_string()));
    }
    filter.to_document()
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn count(&self, collection: &str, filter: &FieldPredicate) -> Result<u64, MaintenanceError> {
        let filter = guarded_filter(collection, filter)?;
        Ok(self.collection(collection).count_documents(filter, None).await?)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &FieldPredicate,
        set: &Map<String, Value>,
    ) -> Result<u64, MaintenanceError> {
        let filter = guarded_filter(collection, filter)?;
        let set = to_document(set.iter().map(|(field, value)| (field.as_str(), value)))?;
        let mut update = Document::new();
        update.insert("$set", set);
        let result = self
            .collection(collection)
            .update_many(filter, update, None)
            .await?;
        info!(
            collection,
            matched = result.matched_count,
            modified = result.modified_count,
            "updated documents"
        );
        Ok(result.modified_count)
    }

    async fn delete_many(&self, collection: &str, filter: &FieldPredicate) -> Result<u64, MaintenanceError> {
        let filter = guarded_filter(collection, filter)?;
        let result = self.collection(collection).delete_many(filter, None).await?;
        info!(collection, deleted = result.deleted_count, "deleted documents");
        Ok(result.deleted_count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub listed: usize,
    pub referenced: usize,
    pub orphans: Vec<String>,
    pub deleted: usize,
}

/// Storage keys referenced by any attachment or thumbnail in `records`.
pub fn referenced_keys(store: &dyn ObjectStore, records: &[RawRecord]) -> HashSet<String> {
    let mut keys = HashSet::new();
    for record in records {
        for column in record.attachment_columns() {
            for attachment in record.attachments(&column) {
                let urls = std::iter::once(attachment.url.as_str())
                    .chain(attachment.thumbnails.values().map(|thumb| thumb.url.as_str()));
                keys.extend(urls.filter_map(|url| store.key_for_url(url)));
            }
        }
    }
    keys
}

/// Delete objects under `prefix` that no snapshot record points at.
pub async fn cleanup_orphans(
    store: &dyn ObjectStore,
    prefix: &str,
    records: &[RawRecord],
    dry_run: bool,
) -> Result<CleanupReport, MaintenanceError> {
    let referenced = referenced_keys(store, records);
    if referenced.is_empty() {
        return Err(MaintenanceError::EmptySnapshot(prefix.to_string()));
    }

    let listed = list_all(store, prefix).await?;
    let orphans: Vec<String> = listed
        .iter()
        .filter(|key| !referenced.contains(*key))
        .cloned()
        .collect();

    let mut report = CleanupReport {
        listed: listed.len(),
        referenced: referenced.len(),
        orphans,
        deleted: 0,
    };
    if dry_run {
        info!(prefix, orphans = report.orphans.len(), "dry run, nothing deleted");
        return Ok(report);
    }

    for batch in report.orphans.chunks(DELETE_BATCH) {
        let deleted = store.delete(batch).await?;
        if deleted < batch.len() {
            warn!(prefix, requested = batch.len(), deleted, "some objects were not deleted");
        }
        report.deleted += deleted;
    }
    info!(prefix, listed = report.listed, deleted = report.deleted, "cleaned up orphaned objects");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use serde_json::json;

    #[test]
    fn assignments_parse_json_scalars_or_fall_back_to_strings() {
        let predicate: FieldPredicate = "category=Art, level=2, published=true".parse().unwrap();
        assert_eq!(
            predicate.clauses(),
            &[
                ("category".to_string(), json!("Art")),
                ("level".to_string(), json!(2)),
                ("published".to_string(), json!(true)),
            ]
        );
        let document = predicate.to_document().unwrap();
        assert_eq!(document.get_str("category").unwrap(), "Art");
        assert!(document.get_bool("published").unwrap());
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        for raw in ["category", "=Art", "  =  "] {
            assert!(matches!(
                parse_assignment(raw),
                Err(MaintenanceError::InvalidPredicate(_))
            ));
        }
    }

    #[test]
    fn empty_filters_are_refused() {
        assert!(matches!(
            guarded_filter("contents", &FieldPredicate::new()),
            Err(MaintenanceError::EmptyPredicate(_))
        ));
    }

    #[tokio::test]
    async fn orphans_are_listed_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).with_public_base("https://cdn.example.com");
        for key in [
            "contents/r1/main.png",
            "contents/r1/main_tiny.png",
            "contents/r1/old.png",
            "contents/r2/gone.mp4",
            "worlds/w1/keep.png",
        ] {
            store.put(key, b"x".to_vec(), "image/png").await.unwrap();
        }
        let records = vec![RawRecord::new("r1").with_field(
            "*메인 이미지",
            json!([{
                "url": "https://cdn.example.com/contents/r1/main.png?width=10&height=10",
                "thumbnails": { "tiny": { "url": "https://cdn.example.com/contents/r1/main_tiny.png" } }
            }]),
        )];

        let preview = cleanup_orphans(&store, "contents/", &records, true).await.unwrap();
        assert_eq!(preview.listed, 4);
        assert_eq!(preview.orphans, vec!["contents/r1/old.png", "contents/r2/gone.mp4"]);
        assert_eq!(preview.deleted, 0);

        let report = cleanup_orphans(&store, "contents/", &records, false).await.unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(
            list_all(&store, "").await.unwrap(),
            vec!["contents/r1/main.png", "contents/r1/main_tiny.png", "worlds/w1/keep.png"]
        );
    }

    #[tokio::test]
    async fn cleanup_refuses_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let err = cleanup_orphans(&store, "contents/", &[], false).await.unwrap_err();
        assert!(matches!(err, MaintenanceError::EmptySnapshot(_)));
    }
}
