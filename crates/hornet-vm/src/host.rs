//! One JavaScript VM and its host-side state.
//!
//! A `VmHost` wraps a QuickJS runtime/context pair, the event loop,
//! and the slot for the currently-executing request. Everything that
//! runs JS runs on the thread that owns the checkout; the only
//! cross-thread operation is `interrupt()`, which flips an atomic the
//! engine's interrupt handler reads.
//!
//! Construction installs the host callbacks first, then the shims in
//! dependency order, then evaluates the worker module and binds its
//! default export to `__worker_module__`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hornet_fetch::OutboundClient;
use parking_lot::Mutex;
use rquickjs::loader::{BuiltinLoader, BuiltinResolver};
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Runtime};
use tracing::{debug, trace};

use crate::error::{VmError, VmResult};
use crate::event_loop::{EventLoop, ReadyIo, FETCH_TARGET};
use crate::hostcalls;
use crate::shims;
use crate::state::RequestState;

/// Name the worker module is registered under in the module loader.
const WORKER_MODULE: &str = "worker";

/// How long module evaluation may take during VM construction.
const MODULE_EVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep used when polling pending I/O.
const IO_POLL: Duration = Duration::from_millis(1);

const BOOTSTRAP_IMPORT: &str = r#"
globalThis.__module_state = 'pending';
globalThis.__module_error = undefined;
import('worker').then(
    function (ns) {
        globalThis.__worker_module__ = (ns && ns.default !== undefined) ? ns.default : ns;
        globalThis.__module_state = 'ready';
    },
    function (e) {
        globalThis.__module_error = __stringifyError(e);
        globalThis.__module_state = 'error';
    }
);
"#;

/// State shared between the VM host and its registered host callbacks.
pub(crate) struct VmShared {
    pub interrupt: AtomicBool,
    pub event_loop: EventLoop,
    pub current: Mutex<Option<Arc<RequestState>>>,
    pub outbound: Arc<OutboundClient>,
    pub started: Instant,
}

/// Thread-safe handle for interrupting a running VM. The watchdog is
/// the only consumer.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<VmShared>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupt.load(Ordering::Relaxed)
    }
}

pub struct VmHost {
    runtime: Runtime,
    context: Context,
    shared: Arc<VmShared>,
}

impl VmHost {
    /// Build a VM: engine, limits, host callbacks, shims, worker
    /// module. Any failure tears the whole thing down.
    pub fn new(
        source: &str,
        memory_limit_bytes: usize,
        outbound: Arc<OutboundClient>,
    ) -> VmResult<Self> {
        let runtime = Runtime::new().map_err(|e| VmError::create(e.to_string()))?;
        runtime.set_memory_limit(memory_limit_bytes);
        runtime.set_max_stack_size(1024 * 1024);

        let resolver = BuiltinResolver::default().with_module(WORKER_MODULE);
        let loader = BuiltinLoader::default().with_module(WORKER_MODULE, source);
        runtime.set_loader(resolver, loader);

        let shared = Arc::new(VmShared {
            interrupt: AtomicBool::new(false),
            event_loop: EventLoop::new(),
            current: Mutex::new(None),
            outbound,
            started: Instant::now(),
        });

        {
            let flag = shared.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || {
                flag.interrupt.load(Ordering::Relaxed)
            })));
        }

        let context = Context::full(&runtime).map_err(|e| VmError::create(e.to_string()))?;
        let host = Self {
            runtime,
            context,
            shared,
        };

        host.with_ctx(|ctx| hostcalls::register(ctx, &host.shared))
            .map_err(|e| VmError::create(format!("host callback registration failed: {e}")))?;
        host.install_shims()?;
        host.load_worker_module()?;
        debug!("VM initialized");
        Ok(host)
    }

    fn install_shims(&self) -> VmResult<()> {
        for shim in shims::install_order()? {
            self.with_ctx(|ctx| ctx.eval::<(), _>(shim.source))
                .map_err(|e| VmError::create(format!("shim '{}' failed: {e}", shim.name)))?;
        }
        Ok(())
    }

    fn load_worker_module(&self) -> VmResult<()> {
        self.eval(BOOTSTRAP_IMPORT)
            .map_err(|e| VmError::Compile(e.to_string()))?;
        let deadline = Instant::now() + MODULE_EVAL_TIMEOUT;
        loop {
            self.pump_microtasks();
            match self.global_string("__module_state")?.as_deref() {
                Some("ready") => break,
                Some("error") => {
                    let message = self
                        .global_string("__module_error")?
                        .unwrap_or_else(|| "module evaluation failed".to_string());
                    return Err(VmError::Compile(message));
                }
                _ => {
                    if Instant::now() >= deadline {
                        return Err(VmError::Compile(
                            "module evaluation did not complete".to_string(),
                        ));
                    }
                    // Top-level awaits may be parked on timers or I/O.
                    self.drain(Instant::now() + Duration::from_millis(5))?;
                }
            }
        }

        let bound = self.with_ctx(|ctx| {
            ctx.eval::<bool, _>("__worker_module__ !== undefined && __worker_module__ !== null")
        })?;
        if !bound {
            return Err(VmError::Compile("module has no export".to_string()));
        }
        Ok(())
    }

    /// Run a closure against the JS context, converting any caught
    /// exception into a `VmError` with its JS-side description.
    pub(crate) fn with_ctx<T>(
        &self,
        f: impl FnOnce(&Ctx<'_>) -> rquickjs::Result<T>,
    ) -> VmResult<T> {
        self.context.with(|ctx| {
            f(&ctx)
                .catch(&ctx)
                .map_err(|caught| VmError::js(describe_caught(&caught)))
        })
    }

    /// Evaluate a script for effect.
    pub fn eval(&self, code: &str) -> VmResult<()> {
        let result = self.with_ctx(|ctx| ctx.eval::<(), _>(code));
        match result {
            Err(err) if self.is_interrupted() => {
                trace!(error = %err, "evaluation cut short by interrupt");
                Err(VmError::Interrupted)
            }
            other => other,
        }
    }

    /// Evaluate a script that produces a string.
    pub fn eval_to_string(&self, code: &str) -> VmResult<String> {
        let result = self.with_ctx(|ctx| ctx.eval::<String, _>(code));
        match result {
            Err(err) if self.is_interrupted() => {
                trace!(error = %err, "evaluation cut short by interrupt");
                Err(VmError::Interrupted)
            }
            other => other,
        }
    }

    /// Read a string-valued global; undefined and null read as `None`.
    pub fn global_string(&self, name: &str) -> VmResult<Option<String>> {
        self.with_ctx(|ctx| ctx.globals().get::<_, Option<String>>(name))
    }

    /// Pump the microtask queue to quiescence. Jobs that raise are
    /// counted and logged; they do not stop the pump.
    pub fn pump_microtasks(&self) -> usize {
        let mut ran = 0usize;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(_) => {
                    ran += 1;
                    trace!("microtask raised an exception");
                }
            }
        }
        ran
    }

    /// Drive timers and pending I/O until the loop is quiet or the
    /// deadline passes.
    ///
    /// Round order: deliver every I/O completion that is already
    /// ready, then either return (nothing pending), poll I/O (no
    /// timers), or take the earliest-deadline timer and fire it,
    /// sleeping toward it in short slices so fresh I/O still wins.
    /// Microtasks are pumped after every delivery and every fire.
    pub fn drain(&self, deadline: Instant) -> VmResult<()> {
        loop {
            let ready = self.shared.event_loop.take_ready_io();
            if !ready.is_empty() {
                for io in ready {
                    self.deliver_io(io)?;
                }
                continue;
            }

            if self.is_interrupted() {
                return Err(VmError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }

            let has_io = self.shared.event_loop.has_pending_io();
            let next_timer = self.shared.event_loop.next_timer_deadline();
            match (has_io, next_timer) {
                (false, None) => return Ok(()),
                (true, None) => std::thread::sleep(IO_POLL.min(deadline - now)),
                (_, Some(when)) if when > deadline => {
                    // The timer cannot fire inside this drain; keep
                    // polling I/O until the deadline.
                    if !has_io {
                        return Ok(());
                    }
                    std::thread::sleep(IO_POLL.min(deadline - now));
                }
                (_, Some(when)) if when > now => {
                    std::thread::sleep(IO_POLL.min(when - now));
                }
                (_, Some(_)) => {
                    if let Some(timer) = self.shared.event_loop.pop_due_timer(now) {
                        let repeating = timer.interval.is_some();
                        self.eval(&format!("__fireTimer({}, {})", timer.id, repeating))?;
                        if let Some(interval) = timer.interval {
                            self.shared.event_loop.reschedule(timer, interval);
                        }
                        self.pump_microtasks();
                    }
                }
            }
        }
    }

    fn deliver_io(&self, io: ReadyIo) -> VmResult<()> {
        if io.target.resolve_fn == FETCH_TARGET.resolve_fn {
            if let Some(state) = self.current_request() {
                state.remove_cancel_handle(io.id);
            }
        }
        let call = match &io.payload {
            Ok(json) => format!(
                "{}({}, {})",
                io.target.resolve_fn,
                io.id,
                js_string_literal(json)
            ),
            Err(message) => format!(
                "{}({}, {})",
                io.target.reject_fn,
                io.id,
                js_string_literal(message)
            ),
        };
        self.eval(&call)?;
        self.pump_microtasks();
        Ok(())
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// Bind a request to this VM for the duration of one execution.
    pub fn begin_request(&self, state: Arc<RequestState>) -> VmResult<()> {
        let id = state.id();
        *self.shared.current.lock() = Some(state);
        self.eval(&format!("globalThis.__requestID = {id};"))
    }

    /// Unbind and clear the request. Returns the state so the caller
    /// can collect logs.
    pub fn end_request(&self) -> Option<Arc<RequestState>> {
        let state = self.shared.current.lock().take();
        if let Some(st) = &state {
            st.clear();
        }
        state
    }

    pub fn current_request(&self) -> Option<Arc<RequestState>> {
        self.shared.current.lock().clone()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupt.load(Ordering::Relaxed)
    }

    /// Milliseconds since this VM was created; the `performance.now()`
    /// anchor.
    pub fn uptime_ms(&self) -> f64 {
        self.shared.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Called when a VM returns to its pool: clears timers and pending
    /// I/O, wipes the reserved globals, and verifies the loop is
    /// quiescent and the module binding intact.
    pub fn reset(&self) -> VmResult<()> {
        if self.is_interrupted() {
            return Err(VmError::Interrupted);
        }
        self.shared.event_loop.clear();
        *self.shared.current.lock() = None;
        self.eval("__hornetReset();")?;
        self.pump_microtasks();

        if self.shared.event_loop.has_pending() {
            return Err(VmError::Dirty("event loop still has pending work".to_string()));
        }
        if self.runtime.is_job_pending() {
            return Err(VmError::Dirty("microtask queue not empty".to_string()));
        }
        let bound = self.with_ctx(|ctx| {
            ctx.eval::<bool, _>(
                "typeof __worker_module__ === 'object' || typeof __worker_module__ === 'function'",
            )
        })?;
        if !bound {
            return Err(VmError::Dirty("worker module binding lost".to_string()));
        }
        Ok(())
    }

    /// Drop the VM. Consumes it so a closed VM cannot be reused.
    pub fn close(self) {
        drop(self);
    }
}

/// Render a caught JS error for host-side messages.
fn describe_caught(caught: &CaughtError<'_>) -> String {
    match caught {
        CaughtError::Error(e) => e.to_string(),
        CaughtError::Exception(ex) => {
            let message = ex
                .message()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "unknown error".to_string());
            match ex.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => message,
            }
        }
        CaughtError::Value(value) => format!("exception of type {}", value.type_name()),
    }
}

/// Quote a Rust string as a JS string literal.
pub(crate) fn js_string_literal(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
