//! Engine configuration.

use std::time::Duration;

use hornet_fetch::FetchPolicy;

/// The recognized engine options, exhaustively.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Preloaded VMs per deployment.
    pub pool_size: usize,
    /// Heap limit per VM.
    pub memory_limit_mb: usize,
    /// Wall-clock bound for one execution, handler through teardown.
    pub execution_timeout_ms: u64,
    /// Outbound fetches allowed per execution.
    pub max_outbound_requests: usize,
    /// Timeout for one outbound request, all redirect hops included.
    pub outbound_timeout_sec: u64,
    /// Response bodies are truncated to this many bytes.
    pub max_response_bytes: usize,
    /// `compile_and_cache` rejects scripts larger than this.
    pub max_script_size_kb: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            memory_limit_mb: 128,
            execution_timeout_ms: 30_000,
            max_outbound_requests: 50,
            outbound_timeout_sec: 30,
            max_response_bytes: 10 * 1024 * 1024,
            max_script_size_kb: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn memory_limit_mb(mut self, mb: usize) -> Self {
        self.memory_limit_mb = mb.max(1);
        self
    }

    pub fn execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms.max(1);
        self
    }

    pub fn max_outbound_requests(mut self, count: usize) -> Self {
        self.max_outbound_requests = count;
        self
    }

    pub fn outbound_timeout_sec(mut self, seconds: u64) -> Self {
        self.outbound_timeout_sec = seconds.max(1);
        self
    }

    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    pub fn max_script_size_kb(mut self, kb: usize) -> Self {
        self.max_script_size_kb = kb.max(1);
        self
    }

    pub(crate) fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub(crate) fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb * 1024 * 1024
    }

    pub(crate) fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.outbound_timeout_sec),
            max_response_bytes: self.max_response_bytes,
            allow_private_network: false,
        }
    }
}
