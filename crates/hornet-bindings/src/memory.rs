//! In-memory binding implementations.
//!
//! These back the test suites and the CLI runner. They are not
//! production stores: TTLs are honored lazily, nothing persists, and
//! the database returns canned results instead of executing SQL.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::http::{HostRequest, HostResponse};
use crate::traits::{
    AssetsFetcher, BindingResult, Bucket, CacheApi, Database, DbResult, DurableObjectNamespace,
    KvListPage, KvStore, ObjectMetadata, Queue, StoredObject,
};

#[derive(Clone)]
struct KvRecord {
    value: String,
    expires_at: Option<Instant>,
}

/// Key-value store over a sorted map so `list` pagination is stable.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, KvRecord>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> BindingResult<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(record) if record.expires_at.is_some_and(|t| t <= Instant::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(record) => Ok(Some(record.value.clone())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: String, ttl_seconds: Option<u64>) -> BindingResult<()> {
        let record = KvRecord {
            value,
            expires_at: ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
        };
        self.entries.lock().insert(key.to_string(), record);
        Ok(())
    }

    fn delete(&self, key: &str) -> BindingResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> BindingResult<KvListPage> {
        let entries = self.entries.lock();
        let prefix = prefix.unwrap_or("");
        let keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| cursor.is_none_or(|c| k.as_str() > c))
            .take(limit + 1)
            .cloned()
            .collect();
        let complete = keys.len() <= limit;
        let mut keys = keys;
        keys.truncate(limit);
        let cursor = if complete { None } else { keys.last().cloned() };
        Ok(KvListPage {
            keys,
            cursor,
            complete,
        })
    }
}

/// Canned-result database: `query` answers with the first canned
/// result whose pattern is a substring of the SQL, and records every
/// statement for assertions.
#[derive(Default)]
pub struct MemoryDatabase {
    canned: Mutex<Vec<(String, DbResult)>>,
    executed: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can(&self, sql_fragment: impl Into<String>, result: DbResult) {
        self.canned.lock().push((sql_fragment.into(), result));
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

impl Database for MemoryDatabase {
    fn query(&self, sql: &str, _params: &[serde_json::Value]) -> BindingResult<DbResult> {
        self.executed.lock().push(sql.to_string());
        let canned = self.canned.lock();
        Ok(canned
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }

    fn exec(&self, sql: &str) -> BindingResult<u64> {
        self.executed.lock().push(sql.to_string());
        Ok(0)
    }
}

/// Queue that remembers what was sent.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<serde_json::Value>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<serde_json::Value> {
        self.messages.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Queue for MemoryQueue {
    fn send(&self, body: serde_json::Value, _delay_seconds: Option<u64>) -> BindingResult<()> {
        self.messages.lock().push_back(body);
        Ok(())
    }

    fn send_batch(&self, bodies: Vec<serde_json::Value>) -> BindingResult<()> {
        self.messages.lock().extend(bodies);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBucket {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bucket for MemoryBucket {
    fn get(&self, key: &str) -> BindingResult<Option<StoredObject>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    fn head(&self, key: &str) -> BindingResult<Option<ObjectMetadata>> {
        Ok(self.objects.lock().get(key).map(|o| o.metadata.clone()))
    }

    fn put(&self, key: &str, body: Vec<u8>, content_type: Option<String>) -> BindingResult<()> {
        let object = StoredObject {
            metadata: ObjectMetadata {
                key: key.to_string(),
                size: body.len() as u64,
                content_type,
            },
            body,
        };
        self.objects.lock().insert(key.to_string(), object);
        Ok(())
    }

    fn delete(&self, key: &str) -> BindingResult<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    fn list(&self, prefix: Option<&str>, limit: usize) -> BindingResult<Vec<ObjectMetadata>> {
        let prefix = prefix.unwrap_or("");
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|o| o.metadata.key.starts_with(prefix))
            .take(limit)
            .map(|o| o.metadata.clone())
            .collect())
    }
}

/// URL-keyed response cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, HostResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheApi for MemoryCache {
    fn lookup(&self, url: &str) -> BindingResult<Option<HostResponse>> {
        Ok(self.entries.lock().get(url).cloned())
    }

    fn put(&self, url: &str, response: HostResponse) -> BindingResult<()> {
        self.entries.lock().insert(url.to_string(), response);
        Ok(())
    }

    fn delete(&self, url: &str) -> BindingResult<bool> {
        Ok(self.entries.lock().remove(url).is_some())
    }
}

/// Path-keyed static assets, served by URL path.
#[derive(Default)]
pub struct StaticAssets {
    files: HashMap<String, (String, Vec<u8>)>,
}

impl StaticAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(
        mut self,
        path: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.files
            .insert(path.into(), (content_type.into(), body.into()));
        self
    }
}

impl AssetsFetcher for StaticAssets {
    fn fetch(&self, request: &HostRequest) -> BindingResult<HostResponse> {
        let path = request
            .url
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("/")
            .split('?')
            .next()
            .unwrap_or("/");
        match self.files.get(path) {
            Some((content_type, body)) => Ok(HostResponse::ok(body.clone())
                .with_header("content-type", content_type.clone())),
            None => Ok(HostResponse::default()
                .with_status(404, "Not Found")
                .with_header("content-type", "text/plain")),
        }
    }
}

/// Durable-object namespace where each id is an isolated KV map and
/// fetch exposes GET/PUT of the URL path as the key.
#[derive(Default)]
pub struct MemoryDurableObjects {
    state: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryDurableObjects {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableObjectNamespace for MemoryDurableObjects {
    fn id_from_name(&self, name: &str) -> String {
        // Stable, opaque, and unique per name is all callers rely on.
        format!("do-{:016x}", fxhash(name.as_bytes()))
    }

    fn fetch(&self, id: &str, request: HostRequest) -> BindingResult<HostResponse> {
        let path = request
            .url
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| rest[i..].to_string()))
            .unwrap_or_else(|| "/".to_string());
        let mut state = self.state.lock();
        let object = state.entry(id.to_string()).or_default();
        match request.method.as_str() {
            "PUT" | "POST" => {
                object.insert(path, request.body);
                Ok(HostResponse::default().with_status(204, "No Content"))
            }
            _ => match object.get(&path) {
                Some(body) => Ok(HostResponse::ok(body.clone())),
                None => Ok(HostResponse::default().with_status(404, "Not Found")),
            },
        }
    }
}

fn fxhash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
