//! WebSocket upgrade hand-off.
//!
//! When a handler answers 101 with an attached peer, the dispatcher
//! does not release the VM; it emits a session that owns the VM
//! outright. The HTTP/WebSocket front end drives the session: inbound
//! frames are delivered into the worker's server peer, outbound
//! frames are drained from the host-side queue, and closing the
//! session retires (never releases) the VM.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hornet_vm::{marshal, RequestState, VmHost, WsMessage};
use tracing::{debug, warn};

use crate::pool::VmPool;

/// How long one delivery drives the VM's event loop before returning.
const DISPATCH_SLICE: Duration = Duration::from_millis(20);

pub struct WebSocketSession {
    vm: Option<VmHost>,
    pool: Arc<VmPool>,
    state: Arc<RequestState>,
    pair: u64,
    timeout: Duration,
}

impl WebSocketSession {
    pub(crate) fn new(
        vm: VmHost,
        pool: Arc<VmPool>,
        state: Arc<RequestState>,
        pair: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            vm: Some(vm),
            pool,
            state,
            pair,
            timeout,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.state.id()
    }

    pub fn pair_id(&self) -> u64 {
        self.pair
    }

    /// Whether the worker's server peer called `accept()`.
    pub fn is_accepted(&self) -> bool {
        self.state.ws_pair_accepted(self.pair)
    }

    pub fn is_open(&self) -> bool {
        self.vm.is_some()
    }

    /// Deliver a text frame from the outside peer into the worker.
    pub fn deliver_text(&mut self, data: &str) -> bool {
        let script = format!(
            "__ws_dispatch_message({}, {}, false);",
            self.pair,
            marshal::js_string(data)
        );
        self.dispatch(&script)
    }

    /// Deliver a binary frame from the outside peer into the worker.
    pub fn deliver_binary(&mut self, data: &[u8]) -> bool {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let script = format!(
            "__ws_dispatch_message({}, {}, true);",
            self.pair,
            marshal::js_string(&STANDARD.encode(data))
        );
        self.dispatch(&script)
    }

    /// Drain frames the worker has sent toward the outside peer,
    /// driving the loop briefly so timer-based sends get a chance.
    pub fn poll_outgoing(&mut self) -> Vec<WsMessage> {
        if let Some(vm) = &self.vm {
            vm.pump_microtasks();
            if vm.drain(Instant::now() + Duration::from_millis(1)).is_err() {
                self.fail("event loop fault while polling");
            }
        }
        self.state.take_ws_outgoing(self.pair)
    }

    /// Fire the worker's close event and retire the VM.
    pub fn close(&mut self, code: u16, reason: &str) {
        if let Some(vm) = &self.vm {
            let script = format!(
                "__ws_dispatch_close({}, {}, {});",
                self.pair,
                code,
                marshal::js_string(reason)
            );
            if vm.eval(&script).is_ok() {
                vm.pump_microtasks();
                vm.drain(Instant::now() + DISPATCH_SLICE.min(self.timeout)).ok();
            }
        }
        self.retire();
    }

    fn dispatch(&mut self, script: &str) -> bool {
        let Some(vm) = &self.vm else {
            return false;
        };
        match vm.eval(script) {
            Ok(()) => {
                vm.pump_microtasks();
                if vm
                    .drain(Instant::now() + DISPATCH_SLICE.min(self.timeout))
                    .is_err()
                {
                    self.fail("event loop fault during delivery");
                    return false;
                }
                true
            }
            Err(e) => {
                self.fail(&format!("delivery failed: {e}"));
                false
            }
        }
    }

    fn fail(&mut self, why: &str) {
        warn!(request_id = self.state.id(), "WebSocket session failed: {why}");
        self.retire();
    }

    fn retire(&mut self) {
        if let Some(vm) = self.vm.take() {
            vm.end_request();
            self.pool.retire(vm);
            debug!(request_id = self.state.id(), "WebSocket session ended, VM retired");
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.retire();
    }
}
