//! The Hornet worker execution engine.
//!
//! Executes untrusted JavaScript worker modules in pooled, sandboxed
//! VMs: one VM per execution, a cooperative event loop on the
//! executing thread, wall-clock watchdogs with safe teardown, and all
//! outbound effects mediated with SSRF protection and per-request
//! quotas.
//!
//! ```no_run
//! use hornet_bindings::{Environment, HostRequest};
//! use hornet_engine::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! engine
//!     .compile_and_cache(
//!         "site",
//!         "deploy",
//!         "export default { fetch() { return new Response('ok'); } };",
//!     )
//!     .unwrap();
//! let result = engine.execute(
//!     "site",
//!     "deploy",
//!     Environment::new(),
//!     HostRequest::get("http://example.com/"),
//! );
//! assert_eq!(result.response.unwrap().status, 200);
//! ```

mod config;
mod dispatch;
mod engine;
mod error;
mod pool;
mod result;
mod watchdog;
mod websocket;

pub use config::EngineConfig;
pub use engine::{DeployKey, Engine, SourceLoader};
pub use error::EngineError;
pub use pool::VmPool;
pub use result::ExecutionResult;
pub use websocket::WebSocketSession;

pub use hornet_bindings::{Environment, HostRequest, HostResponse, LogEntry, LogLevel};
pub use hornet_vm::WsMessage;
