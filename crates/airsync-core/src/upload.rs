use std::time::Duration;

use futures_util::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::columns::Destination;

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{method} {url} failed: {source}")]
    Http {
        method: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("entity for {resource} has no {field} value")]
    MissingKey {
        resource: String,
        field: String,
    },
    #[error("{resource} record {key:?} has no _id or id")]
    MissingId { resource: String, key: String },
    #[error("unreadable response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// A record as the downstream API returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadDetail {
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<UpsertAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub success: usize,
    pub failed: usize,
    pub details: Vec<UploadDetail>,
}

impl BatchSummary {
    fn record(&mut self, key: Option<String>, result: Result<UpsertAction, UploadError>) {
        match result {
            Ok(action) => {
                self.success += 1;
                self.details.push(UploadDetail {
                    key,
                    action: Some(action),
                    error: None,
                });
            }
            Err(err) => {
                warn!(key = ?key, error = %err, "upload failed");
                self.failed += 1;
                self.details.push(UploadDetail {
                    key,
                    action: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }
}

/// Client for one REST resource keyed by a natural field.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    client: Client,
    base_url: String,
    resource: String,
    key_field: String,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl ResourceClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        resource: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            resource: resource.into(),
            key_field: key_field.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }

    pub fn for_destination(client: Client, base_url: impl Into<String>, destination: Destination) -> Self {
        Self::new(client, base_url, destination.resource(), destination.natural_key())
    }

    pub fn with_batching(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.resource)
    }

    fn key_of(&self, entity: &Value) -> Option<String> {
        match entity.get(&self.key_field)? {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    async fn send(
        &self,
        method: &'static str,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, UploadError> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|source| UploadError::Http {
                method,
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| UploadError::Http {
            method,
            url: url.clone(),
            source,
        })?;
        if !status.is_success() {
            let mut body = body;
            let mut end = ERROR_BODY_LIMIT.min(body.len());
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            return Err(UploadError::Status {
                method,
                url,
                status,
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| UploadError::Decode {
            url,
            message: err.to_string(),
        })
    }

    /// Find the remote record whose natural key equals `key`.
    pub async fn lookup(&self, key: &str) -> Result<Option<RemoteRecord>, UploadError> {
        let url = self.collection_url();
        let request = self.client.get(&url).query(&[(self.key_field.as_str(), key)]);
        let body = self.send("GET", url, request).await?;

        let Some(found) = select_match(body, &self.key_field, key) else {
            return Ok(None);
        };
        let id = remote_id(&found).ok_or_else(|| UploadError::MissingId {
            resource: self.resource.clone(),
            key: key.to_string(),
        })?;
        Ok(Some(RemoteRecord { id, body: found }))
    }

    pub async fn create(&self, entity: &Value) -> Result<Value, UploadError> {
        let url = self.collection_url();
        let request = self.client.post(&url).json(entity);
        let created = self.send("POST", url, request).await?;
        debug!(resource = %self.resource, key = ?self.key_of(entity), "created");
        Ok(created)
    }

    /// Patch the record with the same natural key, creating it when none exists.
    pub async fn update(&self, entity: &Value) -> Result<UpsertAction, UploadError> {
        let key = self.key_of(entity).ok_or_else(|| UploadError::MissingKey {
            resource: self.resource.clone(),
            field: self.key_field.clone(),
        })?;
        match self.lookup(&key).await? {
            Some(existing) => {
                let url = format!("{}/{}", self.collection_url(), urlencoding::encode(&existing.id));
                let request = self.client.patch(&url).json(entity);
                self.send("PATCH", url, request).await?;
                debug!(resource = %self.resource, key, id = %existing.id, "updated");
                Ok(UpsertAction::Updated)
            }
            None => {
                self.create(entity).await?;
                Ok(UpsertAction::Created)
            }
        }
    }

    pub async fn create_many(&self, entities: &[Value]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let chunk_count = entities.len().div_ceil(self.chunk_size);
        for (index, chunk) in entities.chunks(self.chunk_size).enumerate() {
            let results = join_all(chunk.iter().map(|entity| async move {
                self.create(entity).await.map(|_| UpsertAction::Created)
            }))
            .await;
            for (entity, result) in chunk.iter().zip(results) {
                summary.record(self.key_of(entity), result);
            }
            self.pause_between(index, chunk_count).await;
        }
        info!(resource = %self.resource, success = summary.success, failed = summary.failed, "create_many finished");
        summary
    }

    pub async fn update_many(&self, entities: &[Value]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let chunk_count = entities.len().div_ceil(self.chunk_size);
        for (index, chunk) in entities.chunks(self.chunk_size).enumerate() {
            let results = join_all(chunk.iter().map(|entity| self.update(entity))).await;
            for (entity, result) in chunk.iter().zip(results) {
                summary.record(self.key_of(entity), result);
            }
            self.pause_between(index, chunk_count).await;
        }
        info!(resource = %self.resource, success = summary.success, failed = summary.failed, "update_many finished");
        summary
    }

    async fn pause_between(&self, index: usize, chunk_count: usize) {
        if index + 1 < chunk_count && !self.chunk_delay.is_zero() {
            sleep(self.chunk_delay).await;
        }
    }
}

/// Accept a bare array, `{ "data": [...] }` or a single object.
///
/// From a list, the item whose key field equals `key` wins; a lone item is taken as is.
fn select_match(body: Value, key_field: &str, key: &str) -> Option<Value> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("data") {
            Some(Value::Array(items)) => items,
            Some(Value::Object(single)) => vec![Value::Object(single)],
            Some(_) | None if object.is_empty() => return None,
            Some(_) | None => vec![Value::Object(object)],
        },
        _ => return None,
    };

    let exact = items
        .iter()
        .position(|item| item.get(key_field).and_then(Value::as_str) == Some(key));
    match exact {
        Some(index) => items.into_iter().nth(index),
        // A lone row without the key field is taken as the match.
        None if items.len() == 1 && items[0].get(key_field).is_none() => items.into_iter().next(),
        None => None,
    }
}

fn remote_id(record: &Value) -> Option<String> {
    ["_id", "id"].iter().find_map(|field| match record.get(*field)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(object) => object.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_shapes_are_all_accepted() {
        let bare = json!([{ "_id": "1", "title": "Other" }, { "_id": "2", "title": "Test" }]);
        assert_eq!(select_match(bare, "title", "Test").unwrap()["_id"], "2");

        let wrapped = json!({ "data": [{ "id": 7, "title": "Test" }] });
        let found = select_match(wrapped, "title", "Test").unwrap();
        assert_eq!(remote_id(&found).as_deref(), Some("7"));

        let single = json!({ "_id": { "$oid": "abc" }, "title": "Test" });
        let found = select_match(single, "title", "Test").unwrap();
        assert_eq!(remote_id(&found).as_deref(), Some("abc"));
    }

    #[test]
    fn empty_or_ambiguous_lookups_find_nothing() {
        assert_eq!(select_match(json!([]), "title", "Test"), None);
        assert_eq!(select_match(json!({ "data": [] }), "title", "Test"), None);
        assert_eq!(select_match(json!({}), "title", "Test"), None);
        assert_eq!(select_match(json!(null), "title", "Test"), None);
        let unrelated = json!([{ "_id": "1", "title": "A" }, { "_id": "2", "title": "B" }]);
        assert_eq!(select_match(unrelated, "title", "Test"), None);
    }

    #[test]
    fn lone_row_with_another_key_is_not_a_match() {
        let other = json!([{ "_id": "other", "title": "Bar" }]);
        assert_eq!(select_match(other, "title", "Foo"), None);

        let keyless = json!({ "data": [{ "_id": "only" }] });
        assert_eq!(select_match(keyless, "title", "Foo").unwrap()["_id"], "only");
    }

    #[test]
    fn destination_clients_use_resource_and_key() {
        let client = ResourceClient::for_destination(
            Client::new(),
            "https://api.example.com/v1/",
            Destination::PostingGuides,
        );
        assert_eq!(client.collection_url(), "https://api.example.com/v1/posting-guides");
        assert_eq!(client.key_field(), "title");
        assert_eq!(client.key_of(&json!({ "title": "  " })), None);
        assert_eq!(client.key_of(&json!({ "title": "Fold" })).as_deref(), Some("Fold"));
    }
}
