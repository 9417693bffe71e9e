//! The narrow traits each binding kind implements.
//!
//! A binding back-end (real KV service, SQLite database, queue broker)
//! lives outside this workspace; the engine only calls through these
//! seams. All methods are synchronous; the engine invokes them from
//! its outbound worker pool, never from the VM thread.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env::Environment;
use crate::http::{HostRequest, HostResponse};
use crate::log::LogEntry;

#[derive(Debug, Clone, Error)]
pub enum BindingError {
    /// The back-end failed; the message is surfaced to JS verbatim.
    #[error("{0}")]
    Backend(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BindingError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

pub type BindingResult<T> = Result<T, BindingError>;

/// One page of a KV `list` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvListPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
    pub complete: bool,
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> BindingResult<Option<String>>;
    fn put(&self, key: &str, value: String, ttl_seconds: Option<u64>) -> BindingResult<()>;
    fn delete(&self, key: &str) -> BindingResult<()>;
    fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> BindingResult<KvListPage>;
}

/// Result of a database query or statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbResult {
    /// One JSON object per row.
    pub rows: Vec<serde_json::Value>,
    pub rows_affected: u64,
    pub last_insert_rowid: Option<i64>,
}

pub trait Database: Send + Sync {
    fn query(&self, sql: &str, params: &[serde_json::Value]) -> BindingResult<DbResult>;
    fn exec(&self, sql: &str) -> BindingResult<u64>;
}

pub trait Queue: Send + Sync {
    fn send(&self, body: serde_json::Value, delay_seconds: Option<u64>) -> BindingResult<()>;
    fn send_batch(&self, bodies: Vec<serde_json::Value>) -> BindingResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub metadata: ObjectMetadata,
    pub body: Vec<u8>,
}

pub trait Bucket: Send + Sync {
    fn get(&self, key: &str) -> BindingResult<Option<StoredObject>>;
    fn head(&self, key: &str) -> BindingResult<Option<ObjectMetadata>>;
    fn put(&self, key: &str, body: Vec<u8>, content_type: Option<String>) -> BindingResult<()>;
    fn delete(&self, key: &str) -> BindingResult<()>;
    fn list(&self, prefix: Option<&str>, limit: usize) -> BindingResult<Vec<ObjectMetadata>>;
}

/// Static-asset lookup for `env.ASSETS.fetch(request)`.
pub trait AssetsFetcher: Send + Sync {
    fn fetch(&self, request: &HostRequest) -> BindingResult<HostResponse>;
}

/// The cache API; `lookup` is the JS `match`.
pub trait CacheApi: Send + Sync {
    fn lookup(&self, url: &str) -> BindingResult<Option<HostResponse>>;
    fn put(&self, url: &str, response: HostResponse) -> BindingResult<()>;
    fn delete(&self, url: &str) -> BindingResult<bool>;
}

pub trait DurableObjectNamespace: Send + Sync {
    fn id_from_name(&self, name: &str) -> String;
    fn fetch(&self, id: &str, request: HostRequest) -> BindingResult<HostResponse>;
}

/// Target of a service binding: another deployed worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingConfig {
    pub site: String,
    pub deploy: String,
}

/// What a service-binding re-entry hands back. Sub-requests carry no
/// WebSocket upgrades; an upgrade response downgrades to its plain
/// HTTP form.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub response: Option<HostResponse>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub duration: Duration,
}

/// Re-entry point service bindings call back through. The engine
/// implements this; `Environment::dispatcher` carries it.
pub trait WorkerDispatcher: Send + Sync {
    fn dispatch(
        &self,
        site: &str,
        deploy: &str,
        env: Environment,
        request: HostRequest,
    ) -> DispatchOutcome;
}
