use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{AirtableSettings, ConfigError, require};
use crate::record::RawRecord;
use crate::retry::{RetryPolicy, retry_if};

pub const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("table {table} rejected the credentials ({status})")]
    Unauthorized { table: String, status: StatusCode },
    #[error("request for table {table} failed: {source}")]
    Http {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("table {table} returned an unreadable page: {message}")]
    Decode { table: String, message: String },
}

impl TableError {
    fn is_retryable(&self) -> bool {
        match self {
            TableError::Http { source, .. } => match source.status() {
                Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
                None => source.is_timeout() || source.is_connect() || source.is_request(),
            },
            _ => false,
        }
    }
}

/// Anything that can hand back every row of a named table.
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn fetch_table(&self, table: &str, view: Option<&str>) -> Result<Vec<RawRecord>, TableError>;
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    records: Vec<PageRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageRecord {
    id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct AirtableClient {
    client: Client,
    endpoint: String,
    api_key: String,
    base_id: String,
    retry: RetryPolicy,
}

impl AirtableClient {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        base_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            base_id: base_id.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(client: Client, settings: &AirtableSettings) -> Result<Self, TableError> {
        let api_key = require(&settings.api_key, "AIRTABLE_API_KEY")?;
        let base_id = require(&settings.base_id, "AIRTABLE_BASE_ID")?;
        Ok(Self::new(client, settings.endpoint.clone(), api_key, base_id))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/v0/{}/{}",
            self.endpoint,
            self.base_id,
            urlencoding::encode(table)
        )
    }

    async fn fetch_page(
        &self,
        table: &str,
        view: Option<&str>,
        offset: Option<&str>,
    ) -> Result<Page, TableError> {
        let page_size = PAGE_SIZE.to_string();
        let mut query: Vec<(&str, &str)> = vec![("pageSize", page_size.as_str())];
        if let Some(view) = view {
            query.push(("view", view));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset));
        }

        let http = |source: reqwest::Error| TableError::Http {
            table: table.to_string(),
            source,
        };
        let response = self
            .client
            .get(self.table_url(table))
            .bearer_auth(&self.api_key)
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(http)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TableError::Unauthorized {
                table: table.to_string(),
                status,
            });
        }
        let body = response.error_for_status().map_err(http)?.text().await.map_err(http)?;
        serde_json::from_str(&body).map_err(|err| TableError::Decode {
            table: table.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl TableSource for AirtableClient {
    async fn fetch_table(&self, table: &str, view: Option<&str>) -> Result<Vec<RawRecord>, TableError> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let label = format!("airtable {table} page {}", pages + 1);
            let page = retry_if(
                &label,
                &self.retry,
                || self.fetch_page(table, view, offset.as_deref()),
                TableError::is_retryable,
            )
            .await?;
            pages += 1;
            debug!(table, page = pages, rows = page.records.len(), "fetched page");

            records.extend(page.records.into_iter().map(|row| RawRecord {
                id: row.id,
                fields: row.fields,
            }));
            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }

        info!(table, view, pages, records = records.len(), "fetched table");
        Ok(records)
    }
}
