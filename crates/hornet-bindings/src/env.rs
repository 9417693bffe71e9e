//! The environment a worker execution sees.
//!
//! The shape is fixed: explicit maps per binding kind plus the vars and
//! secrets. Nothing is read from the host process environment; if it
//! is not in these maps, the worker cannot see it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::traits::{
    AssetsFetcher, Bucket, CacheApi, Database, DurableObjectNamespace, KvStore, Queue,
    ServiceBindingConfig, WorkerDispatcher,
};

#[derive(Default, Clone)]
pub struct Environment {
    pub vars: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub kv: HashMap<String, Arc<dyn KvStore>>,
    pub d1: HashMap<String, Arc<dyn Database>>,
    pub queues: HashMap<String, Arc<dyn Queue>>,
    pub storage: HashMap<String, Arc<dyn Bucket>>,
    pub durable_objects: HashMap<String, Arc<dyn DurableObjectNamespace>>,
    pub services: HashMap<String, ServiceBindingConfig>,
    pub assets: Option<Arc<dyn AssetsFetcher>>,
    pub cache: Option<Arc<dyn CacheApi>>,
    /// Stamped by the engine facade before every execution.
    pub site_id: String,
    /// Stamped by the engine facade; service bindings re-enter through it.
    pub dispatcher: Option<Arc<dyn WorkerDispatcher>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    pub fn with_kv(mut self, name: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        self.kv.insert(name.into(), store);
        self
    }

    pub fn with_d1(mut self, name: impl Into<String>, db: Arc<dyn Database>) -> Self {
        self.d1.insert(name.into(), db);
        self
    }

    pub fn with_queue(mut self, name: impl Into<String>, queue: Arc<dyn Queue>) -> Self {
        self.queues.insert(name.into(), queue);
        self
    }

    pub fn with_bucket(mut self, name: impl Into<String>, bucket: Arc<dyn Bucket>) -> Self {
        self.storage.insert(name.into(), bucket);
        self
    }

    pub fn with_durable_objects(
        mut self,
        name: impl Into<String>,
        ns: Arc<dyn DurableObjectNamespace>,
    ) -> Self {
        self.durable_objects.insert(name.into(), ns);
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, target: ServiceBindingConfig) -> Self {
        self.services.insert(name.into(), target);
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetsFetcher>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheApi>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("site_id", &self.site_id)
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("kv", &self.kv.keys().collect::<Vec<_>>())
            .field("d1", &self.d1.keys().collect::<Vec<_>>())
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("storage", &self.storage.keys().collect::<Vec<_>>())
            .field(
                "durable_objects",
                &self.durable_objects.keys().collect::<Vec<_>>(),
            )
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("assets", &self.assets.is_some())
            .field("cache", &self.cache.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}
