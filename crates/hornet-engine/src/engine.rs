//! The engine facade: source cache, pool map, and the execute entry
//! points.
//!
//! Both maps are read-mostly concurrent maps; pool creation is
//! serialized by a mutex so two concurrent executions for the same
//! deployment create at most one pool, while the steady-state lookup
//! stays lock-free on the dashmap.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use hornet_bindings::{
    DispatchOutcome, Environment, HostRequest, WorkerDispatcher,
};
use hornet_fetch::OutboundClient;
use hornet_vm::VmHost;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dispatch::{self, WorkKind};
use crate::error::EngineError;
use crate::pool::VmPool;
use crate::result::ExecutionResult;

/// Identifies one immutable compiled worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeployKey {
    pub site: String,
    pub deploy: String,
}

impl DeployKey {
    pub fn new(site: impl Into<String>, deploy: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            deploy: deploy.into(),
        }
    }
}

impl fmt::Display for DeployKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.deploy)
    }
}

/// Loads worker sources the engine has not seen yet.
pub trait SourceLoader: Send + Sync {
    fn get_worker_script(&self, site: &str, deploy: &str) -> Option<String>;
}

pub struct Engine {
    config: EngineConfig,
    sources: DashMap<DeployKey, Arc<str>>,
    pools: DashMap<DeployKey, Arc<VmPool>>,
    pool_create: Mutex<()>,
    outbound: Arc<OutboundClient>,
    loader: Option<Arc<dyn SourceLoader>>,
    weak_self: Weak<Engine>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        Self::build(config, None)
    }

    pub fn with_loader(
        config: EngineConfig,
        loader: Arc<dyn SourceLoader>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::build(config, Some(loader))
    }

    fn build(
        config: EngineConfig,
        loader: Option<Arc<dyn SourceLoader>>,
    ) -> Result<Arc<Self>, EngineError> {
        let outbound = Arc::new(
            OutboundClient::new(config.fetch_policy())
                .map_err(|e| EngineError::PoolInit(e.to_string()))?,
        );
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            sources: DashMap::new(),
            pools: DashMap::new(),
            pool_create: Mutex::new(()),
            outbound,
            loader,
            weak_self: weak.clone(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make sure a source is cached for the deployment, loading it
    /// through the source loader if necessary.
    pub fn ensure_source(&self, site: &str, deploy: &str) -> Result<Arc<str>, EngineError> {
        let key = DeployKey::new(site, deploy);
        if let Some(cached) = self.sources.get(&key) {
            return Ok(cached.clone());
        }
        let loaded = self
            .loader
            .as_ref()
            .and_then(|l| l.get_worker_script(site, deploy))
            .ok_or_else(|| EngineError::no_source(site, deploy))?;
        let source: Arc<str> = Arc::from(loaded.as_str());
        self.sources.insert(key, source.clone());
        Ok(source)
    }

    /// Validate a script by evaluating it in a throwaway VM, then
    /// cache it. Failures cache nothing.
    pub fn compile_and_cache(
        &self,
        site: &str,
        deploy: &str,
        source: &str,
    ) -> Result<(), EngineError> {
        let limit = self.config.max_script_size_kb * 1024;
        if source.len() > limit {
            return Err(EngineError::Compile(format!(
                "script is {} bytes, limit is {limit}",
                source.len()
            )));
        }

        let probe = VmHost::new(
            source,
            self.config.memory_limit_bytes(),
            self.outbound.clone(),
        )
        .map_err(|e| EngineError::Compile(e.to_string()))?;
        probe.close();

        let key = DeployKey::new(site, deploy);
        self.sources.insert(key.clone(), Arc::from(source));
        debug!(key = %key, "source compiled and cached");
        Ok(())
    }

    /// HTTP entry point. Always returns an execution result.
    pub fn execute(
        self: &Arc<Self>,
        site: &str,
        deploy: &str,
        env: Environment,
        request: HostRequest,
    ) -> ExecutionResult {
        self.run(site, deploy, env, WorkKind::Fetch { request })
    }

    /// Cron entry point.
    pub fn execute_scheduled(
        self: &Arc<Self>,
        site: &str,
        deploy: &str,
        env: Environment,
        cron: &str,
    ) -> ExecutionResult {
        self.run(
            site,
            deploy,
            env,
            WorkKind::Scheduled {
                cron: cron.to_string(),
            },
        )
    }

    /// Log-tail entry point.
    pub fn execute_tail(
        self: &Arc<Self>,
        site: &str,
        deploy: &str,
        env: Environment,
        events: Vec<serde_json::Value>,
    ) -> ExecutionResult {
        self.run(site, deploy, env, WorkKind::Tail { events })
    }

    /// Arbitrary named export; arguments and the return value are
    /// JSON-serializable.
    pub fn execute_function(
        self: &Arc<Self>,
        site: &str,
        deploy: &str,
        env: Environment,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> ExecutionResult {
        self.run(
            site,
            deploy,
            env,
            WorkKind::Function {
                name: name.to_string(),
                args,
            },
        )
    }

    fn run(
        self: &Arc<Self>,
        site: &str,
        deploy: &str,
        mut env: Environment,
        kind: WorkKind,
    ) -> ExecutionResult {
        let started = std::time::Instant::now();

        // Stamp the facade-owned fields so service bindings can call
        // back into this engine.
        env.site_id = site.to_string();
        env.dispatcher = Some(self.clone() as Arc<dyn WorkerDispatcher>);
        let env = Arc::new(env);

        let source = match self.ensure_source(site, deploy) {
            Ok(source) => source,
            Err(e) => return ExecutionResult::from_error(e, started.elapsed()),
        };
        let pool = match self.get_or_create_pool(site, deploy, &source) {
            Ok(pool) => pool,
            Err(e) => return ExecutionResult::from_error(e, started.elapsed()),
        };

        dispatch::run(&pool, &self.config, env, kind, site, deploy)
    }

    /// Lock-free lookup in the steady state; creation (and the
    /// replacement of an invalidated pool) is serialized.
    fn get_or_create_pool(
        &self,
        site: &str,
        deploy: &str,
        source: &Arc<str>,
    ) -> Result<Arc<VmPool>, EngineError> {
        let key = DeployKey::new(site, deploy);
        if let Some(pool) = self.pools.get(&key) {
            if !pool.is_invalid() {
                return Ok(pool.clone());
            }
        }

        let _creating = self.pool_create.lock();
        // Another creator may have won while we waited on the lock.
        if let Some(pool) = self.pools.get(&key) {
            if !pool.is_invalid() {
                return Ok(pool.clone());
            }
        }

        let pool = VmPool::new(
            key.clone(),
            source,
            self.config.pool_size,
            self.config.memory_limit_bytes(),
            &self.outbound,
        )?;
        self.pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Mark the pool invalid and drop the cached source. Checked-out
    /// VMs finish their executions and are retired on the way out.
    pub fn invalidate_pool(&self, site: &str, deploy: &str) {
        let key = DeployKey::new(site, deploy);
        self.sources.remove(&key);
        if let Some((_, pool)) = self.pools.remove(&key) {
            pool.dispose();
            info!(key = %key, "pool invalidated");
        }
    }

    /// Invalidate every pool and drop every source.
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().dispose();
        }
        self.pools.clear();
        self.sources.clear();
        info!("engine shut down");
    }

    /// Idle VMs currently pooled for a deployment, if a pool exists.
    pub fn pool_idle_count(&self, site: &str, deploy: &str) -> Option<usize> {
        self.pools
            .get(&DeployKey::new(site, deploy))
            .map(|p| p.idle_count())
    }

    pub fn has_source(&self, site: &str, deploy: &str) -> bool {
        self.sources.contains_key(&DeployKey::new(site, deploy))
    }
}

impl WorkerDispatcher for Engine {
    /// Re-entry point for service bindings. Sub-requests never carry
    /// WebSocket upgrades; an upgrade response is downgraded to its
    /// plain HTTP form.
    fn dispatch(
        &self,
        site: &str,
        deploy: &str,
        env: Environment,
        request: HostRequest,
    ) -> DispatchOutcome {
        let Some(engine) = self.weak_self.upgrade() else {
            return DispatchOutcome {
                response: None,
                error: Some("engine is shutting down".to_string()),
                logs: Vec::new(),
                duration: Duration::ZERO,
            };
        };
        let result = engine.execute(site, deploy, env, request);
        DispatchOutcome {
            response: result.response,
            error: result.error.map(|e| e.to_string()),
            logs: result.logs,
            duration: result.duration,
        }
    }
}
