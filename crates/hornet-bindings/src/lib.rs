//! Platform surface for the Hornet worker engine.
//!
//! This crate defines what the engine and the outside world agree on:
//! the host-side HTTP request/response shapes, the `Environment` a
//! worker sees, the narrow traits each binding kind implements, and
//! the dispatcher re-entry point service bindings call back through.
//! The engine consumes bindings through these traits and does not
//! otherwise introspect them.

mod env;
mod http;
mod log;
pub mod memory;
mod traits;

pub use env::Environment;
pub use http::{HostRequest, HostResponse};
pub use log::{LogEntry, LogLevel};
pub use traits::{
    AssetsFetcher, BindingError, BindingResult, Bucket, CacheApi, Database, DbResult,
    DispatchOutcome, DurableObjectNamespace, KvListPage, KvStore, ObjectMetadata, Queue,
    ServiceBindingConfig, StoredObject, WorkerDispatcher,
};
