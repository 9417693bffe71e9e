//! The handler dispatcher: one execution from VM checkout to
//! teardown.
//!
//! Every entry point shares the shape: acquire, arm the watchdog,
//! bind request state, stage the JS arguments, invoke, await the
//! result while draining the event loop, convert (or upgrade), drain
//! waitUntil, tear down. Timeouts and host panics jump straight to
//! the retire path; a retired VM invalidates its pool.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hornet_bindings::{Environment, HostRequest, LogLevel};
use hornet_vm::{marshal, AwaitOutcome, InvokeStatus, RequestState, VmError, VmHost};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::{AcquireError, VmPool};
use crate::result::ExecutionResult;
use crate::watchdog::Watchdog;
use crate::websocket::WebSocketSession;

pub(crate) enum WorkKind {
    Fetch { request: HostRequest },
    Scheduled { cron: String },
    Tail { events: Vec<serde_json::Value> },
    Function { name: String, args: Vec<serde_json::Value> },
}

impl WorkKind {
    fn handler_name(&self) -> &str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Scheduled { .. } => "scheduled",
            Self::Tail { .. } => "tail",
            Self::Function { name, .. } => name,
        }
    }
}

/// What a successful execution produced before packaging.
enum Success {
    Http(marshal::ConvertedResponse),
    Data(Option<serde_json::Value>),
}

pub(crate) fn run(
    pool: &Arc<VmPool>,
    config: &EngineConfig,
    env: Arc<Environment>,
    kind: WorkKind,
    site: &str,
    deploy: &str,
) -> ExecutionResult {
    let started = Instant::now();
    let deadline = started + config.execution_timeout();

    let vm = match pool.acquire(deadline) {
        Ok(vm) => vm,
        Err(AcquireError::Invalidated) | Err(AcquireError::Timeout) => {
            return ExecutionResult::from_error(
                EngineError::pool_unavailable(site, deploy),
                started.elapsed(),
            );
        }
    };

    let state = RequestState::new(config.max_outbound_requests, env);
    let watchdog = Watchdog::arm(vm.interrupt_handle(), state.clone(), deadline);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let result = execute_on_vm(&vm, &state, &kind, deadline);
        // Background work registered through ctx.waitUntil settles
        // before teardown; rejections are recorded, never fatal.
        // An upgraded VM lives on, so its waitUntil work rides along
        // with the session instead.
        let upgrading = matches!(
            &result,
            Ok(Success::Http(converted)) if is_upgrade(converted)
        );
        if !upgrading {
            match vm.drain_wait_until(deadline) {
                Ok(rejections) => {
                    for reason in rejections {
                        state.push_log(LogLevel::Warn, format!("waitUntil rejected: {reason}"));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "waitUntil drain cut short");
                }
            }
        }
        result
    }));
    watchdog.disarm();
    let timed_out = watchdog.timed_out();
    let duration = started.elapsed();

    match outcome {
        Ok(Ok(Success::Http(converted))) if is_upgrade(&converted) => {
            // Transfer VM ownership to the bridging session; the VM
            // never returns to the pool from here.
            let pair = converted.websocket_pair.expect("upgrade carries a pair id");
            let logs = state.take_logs();
            let session = WebSocketSession::new(
                vm,
                pool.clone(),
                state,
                pair,
                config.execution_timeout(),
            );
            debug!(pair, "execution upgraded to WebSocket session");
            ExecutionResult {
                response: Some(converted.into_host()),
                websocket: Some(session),
                logs,
                data: None,
                duration,
                error: None,
            }
        }
        Ok(result) => {
            vm.end_request();
            let logs = state.take_logs();
            match result {
                Ok(success) => {
                    pool.release(vm);
                    let (response, data) = match success {
                        Success::Http(converted) => (Some(converted.into_host()), None),
                        Success::Data(value) => (None, value),
                    };
                    ExecutionResult {
                        response,
                        websocket: None,
                        logs,
                        data,
                        duration,
                        error: None,
                    }
                }
                Err(error) => {
                    let error = if timed_out || matches!(error, EngineError::Timeout(_)) {
                        EngineError::Timeout(config.execution_timeout_ms)
                    } else {
                        error
                    };
                    pool.retire(vm);
                    ExecutionResult {
                        logs,
                        duration,
                        error: Some(error),
                        ..ExecutionResult::default()
                    }
                }
            }
        }
        Err(panic) => {
            warn!("execution panicked host-side");
            vm.end_request();
            let logs = state.take_logs();
            let error = if timed_out {
                EngineError::Timeout(config.execution_timeout_ms)
            } else {
                EngineError::Panicked(describe_panic(panic))
            };
            pool.retire(vm);
            ExecutionResult {
                logs,
                duration,
                error: Some(error),
                ..ExecutionResult::default()
            }
        }
    }
}

fn is_upgrade(converted: &marshal::ConvertedResponse) -> bool {
    converted.status == 101 && converted.websocket_pair.is_some()
}

fn execute_on_vm(
    vm: &VmHost,
    state: &Arc<RequestState>,
    kind: &WorkKind,
    deadline: Instant,
) -> Result<Success, EngineError> {
    vm.begin_request(state.clone()).map_err(host_fault)?;
    stage_arguments(vm, state, kind).map_err(host_fault)?;

    let handler = kind.handler_name();
    let arg_globals: Vec<&str> = match kind {
        WorkKind::Fetch { .. } => vec!["__req", "__env", "__ctx"],
        WorkKind::Scheduled { .. } => vec!["__event", "__env", "__ctx"],
        WorkKind::Tail { .. } => vec!["__events", "__env", "__ctx"],
        WorkKind::Function { args, .. } => {
            static NAMES: [&str; 8] = [
                "__fn_arg_0",
                "__fn_arg_1",
                "__fn_arg_2",
                "__fn_arg_3",
                "__fn_arg_4",
                "__fn_arg_5",
                "__fn_arg_6",
                "__fn_arg_7",
            ];
            NAMES.iter().take(args.len()).copied().collect()
        }
    };

    match vm.invoke_handler(handler, &arg_globals).map_err(exec_fault)? {
        InvokeStatus::Ok => {}
        InvokeStatus::Missing => return Err(EngineError::HandlerMissing(handler.to_string())),
        InvokeStatus::Threw(reason) => return Err(EngineError::HandlerFaulted(reason)),
    }

    vm.pump_microtasks();
    match vm.await_value("__call_result", deadline).map_err(exec_fault)? {
        AwaitOutcome::Fulfilled => {}
        AwaitOutcome::Rejected(reason) => return Err(EngineError::HandlerFaulted(reason)),
    }

    match kind {
        WorkKind::Fetch { .. } => {
            let raw = vm.eval_to_string("__convertResponse()").map_err(host_fault)?;
            let converted =
                marshal::parse_converted_response(&raw).map_err(EngineError::Conversion)?;
            Ok(Success::Http(converted))
        }
        WorkKind::Scheduled { .. } | WorkKind::Tail { .. } => Ok(Success::Data(None)),
        WorkKind::Function { .. } => {
            let raw = vm.json_global("__call_result").map_err(host_fault)?;
            let value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Conversion(format!("unserializable return value: {e}")))?;
            Ok(Success::Data(Some(value)))
        }
    }
}

/// Stage the handler's arguments into the agreed globals.
fn stage_arguments(
    vm: &VmHost,
    state: &Arc<RequestState>,
    kind: &WorkKind,
) -> Result<(), VmError> {
    let env_payload = marshal::env_payload(state.env());
    vm.eval(&format!(
        "globalThis.__env = __makeEnv({});",
        marshal::js_string(&env_payload)
    ))?;
    vm.eval("globalThis.__ctx = __makeCtx();")?;

    match kind {
        WorkKind::Fetch { request } => {
            let payload = marshal::request_payload(request);
            vm.eval(&format!(
                "globalThis.__req = __makeRequest({});",
                marshal::js_string(&payload)
            ))?;
        }
        WorkKind::Scheduled { cron } => {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64;
            let payload = marshal::scheduled_payload(cron, now_ms);
            vm.eval(&format!(
                "globalThis.__event = __makeScheduledEvent({});",
                marshal::js_string(&payload)
            ))?;
        }
        WorkKind::Tail { events } => {
            let payload = serde_json::to_string(events).unwrap_or_else(|_| "[]".to_string());
            vm.set_json_global("__events", &payload)?;
        }
        WorkKind::Function { args, .. } => {
            for (index, value) in args.iter().enumerate().take(8) {
                let payload = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
                vm.set_json_global(&format!("__fn_arg_{index}"), &payload)?;
            }
        }
    }
    Ok(())
}

/// Bridge failures while staging or converting are host faults.
fn host_fault(e: VmError) -> EngineError {
    match e {
        VmError::Deadline | VmError::Interrupted => EngineError::Timeout(0),
        other => EngineError::Panicked(other.to_string()),
    }
}

/// Failures while the handler itself runs.
fn exec_fault(e: VmError) -> EngineError {
    match e {
        VmError::Deadline | VmError::Interrupted => EngineError::Timeout(0),
        VmError::Js(message) => EngineError::HandlerFaulted(message),
        other => EngineError::Panicked(other.to_string()),
    }
}

fn describe_panic(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
