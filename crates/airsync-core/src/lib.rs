//! Core library for the airsync ETL jobs.
//!
//! Rows are pulled from a tabular source, their media is rehosted on owned
//! object storage, the result is cached in dated snapshot files and, in a
//! separate pass, transformed into destination entities and pushed to the
//! downstream API.

pub mod batch;
pub mod columns;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod media;
pub mod push;
pub mod record;
pub mod retry;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod transform;
pub mod upload;

pub use batch::{BatchDriver, BatchJob, BatchReport};
pub use columns::{ColumnMap, Destination};
pub use config::{JobFile, JobSpec, Settings};
pub use error::SyncError;
pub use media::{MediaRehoster, RehostOptions, RehostOutcome};
pub use record::{Attachment, RawRecord, Tier};
pub use retry::RetryPolicy;
pub use storage::{LocalStore, ObjectStore, S3Store};
pub use table::{AirtableClient, TableSource};
pub use transform::{RecordTransformer, TransformError};
pub use upload::{BatchSummary, ResourceClient};
