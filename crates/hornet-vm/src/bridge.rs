//! The host↔JS calling convention.
//!
//! Complex values cross the boundary through reserved globals
//! (`__req`, `__env`, `__ctx`, `__call_result`, `__fn_arg_N`) and JSON
//! strings; host callbacks only ever see primitives. Handler
//! invocation, promise awaiting, and the waitUntil drain are all
//! built on evaluating small scripts and polling state globals
//! between microtask pumps.

use std::time::{Duration, Instant};

use crate::error::{VmError, VmResult};
use crate::host::{js_string_literal, VmHost};

/// How long one drain slice inside an await loop runs before the
/// settled check happens again.
const AWAIT_SLICE: Duration = Duration::from_millis(10);

/// Terminal state of an awaited value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The global now holds the resolved value.
    Fulfilled,
    /// The stringified rejection reason.
    Rejected(String),
}

/// What invoking a handler did, before its result settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeStatus {
    Ok,
    /// The export is absent or not callable.
    Missing,
    /// The handler threw synchronously; stringified reason.
    Threw(String),
}

impl VmHost {
    /// Invoke `__worker_module__.<name>(...)` with arguments taken
    /// from the named globals.
    pub fn invoke_handler(&self, name: &str, arg_globals: &[&str]) -> VmResult<InvokeStatus> {
        let args = arg_globals
            .iter()
            .map(|g| js_string_literal(g))
            .collect::<Vec<_>>()
            .join(",");
        self.eval(&format!(
            "__invoke({}, [{args}]);",
            js_string_literal(name)
        ))?;
        match self.global_string("__invoke_status")?.as_deref() {
            Some("ok") => Ok(InvokeStatus::Ok),
            Some("missing") => Ok(InvokeStatus::Missing),
            Some("threw") => {
                let reason = self
                    .global_string("__invoke_error")?
                    .unwrap_or_else(|| "unknown error".to_string());
                Ok(InvokeStatus::Threw(reason))
            }
            other => Err(VmError::js(format!(
                "handler invocation left unexpected status {other:?}"
            ))),
        }
    }

    /// Await the value held in a global. If it is a promise (or any
    /// thenable), pump microtasks and drain the event loop until it
    /// settles or the deadline passes; on fulfillment the global is
    /// replaced with the resolved value, so awaiting a non-promise is
    /// the identity.
    pub fn await_value(&self, global: &str, deadline: Instant) -> VmResult<AwaitOutcome> {
        self.eval(&format!("__awaitSetup({});", js_string_literal(global)))?;
        self.pump_microtasks();
        loop {
            match self.global_string("__awaited_state")?.as_deref() {
                Some("fulfilled") => return Ok(AwaitOutcome::Fulfilled),
                Some("rejected") => {
                    let reason = self
                        .global_string("__awaited_result")?
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Ok(AwaitOutcome::Rejected(reason));
                }
                _ => {
                    if self.is_interrupted() {
                        return Err(VmError::Interrupted);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(VmError::Deadline);
                    }
                    self.drain((now + AWAIT_SLICE).min(deadline))?;
                    if self.pump_microtasks() == 0 && !self.event_loop().has_pending() {
                        // Nothing can settle this promise right now.
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
    }

    /// Settle every accumulated `ctx.waitUntil` promise. Rejection
    /// reasons are returned; they never fail the execution.
    pub fn drain_wait_until(&self, deadline: Instant) -> VmResult<Vec<String>> {
        self.eval("__waitUntilSettle();")?;
        self.pump_microtasks();
        loop {
            match self.global_string("__wait_until_state")?.as_deref() {
                Some("done") => {
                    let raw = self
                        .global_string("__wait_until_rejections")?
                        .unwrap_or_else(|| "[]".to_string());
                    return Ok(serde_json::from_str(&raw).unwrap_or_default());
                }
                _ => {
                    if self.is_interrupted() {
                        return Err(VmError::Interrupted);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(VmError::Deadline);
                    }
                    self.drain((now + AWAIT_SLICE).min(deadline))?;
                    self.pump_microtasks();
                }
            }
        }
    }

    /// Assign `JSON.parse(json)` to the named global.
    pub fn set_json_global(&self, name: &str, json: &str) -> VmResult<()> {
        self.eval(&format!(
            "__setJsonGlobal({}, {});",
            js_string_literal(name),
            js_string_literal(json)
        ))
    }

    /// Read a global back as JSON (`undefined` reads as `null`).
    pub fn json_global(&self, name: &str) -> VmResult<String> {
        self.with_ctx(|ctx| {
            ctx.eval::<String, _>(format!("__jsonGlobal({})", js_string_literal(name)))
        })
    }
}
