//! The engine's failure taxonomy. Host-visible failures are captured
//! in the execution result and never raise across the facade;
//! quota and SSRF rejections are JS-visible only and have no variant
//! here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no source for deployment {site}/{deploy}")]
    NoSource { site: String, deploy: String },

    /// The script failed to parse or evaluate.
    #[error("compile error: {0}")]
    Compile(String),

    /// Pool construction failed; no partial pool remains.
    #[error("pool initialization failed: {0}")]
    PoolInit(String),

    /// No VM could be acquired within the execution deadline.
    #[error("no VM available for deployment {site}/{deploy}")]
    PoolUnavailable { site: String, deploy: String },

    #[error("handler '{0}' is not exported or not callable")]
    HandlerMissing(String),

    /// Synchronous throw or rejected promise; the message preserves
    /// the JS-side stringification of the reason.
    #[error("handler faulted: {0}")]
    HandlerFaulted(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    /// Unexpected host-side fault.
    #[error("worker panic: {0}")]
    Panicked(String),

    /// The handler resolved to something that is not a Response.
    #[error("conversion error: {0}")]
    Conversion(String),
}

impl EngineError {
    pub fn no_source(site: &str, deploy: &str) -> Self {
        Self::NoSource {
            site: site.to_string(),
            deploy: deploy.to_string(),
        }
    }

    pub fn pool_unavailable(site: &str, deploy: &str) -> Self {
        Self::PoolUnavailable {
            site: site.to_string(),
            deploy: deploy.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_timed_out() {
        let message = EngineError::Timeout(200).to_string();
        assert!(message.contains("timed out"), "{message}");
        assert!(message.contains("200"));
    }

    #[test]
    fn no_source_names_the_deployment() {
        let message = EngineError::no_source("site-a", "deploy-1").to_string();
        assert!(message.contains("site-a/deploy-1"));
    }
}
