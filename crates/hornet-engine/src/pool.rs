//! The per-deployment VM pool.
//!
//! A pool is built eagerly: all `N` VMs are created, shimmed, and have
//! the worker module evaluated before the pool exists at all; any
//! failure destroys the partial set. Checkout is FIFO through a
//! mutex-and-condvar idle deque. `release` requires a clean exit and
//! re-verifies it via `reset`; `retire` closes the VM and marks the
//! whole pool invalid, so the next acquirer forces a rebuild.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hornet_fetch::OutboundClient;
use hornet_vm::VmHost;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::engine::DeployKey;
use crate::error::EngineError;

pub(crate) enum AcquireError {
    /// The pool was invalidated; the caller rebuilds.
    Invalidated,
    /// No VM became idle before the deadline.
    Timeout,
}

struct PoolInner {
    idle: VecDeque<VmHost>,
    outstanding: usize,
}

pub struct VmPool {
    key: DeployKey,
    size: usize,
    inner: Mutex<PoolInner>,
    available: Condvar,
    invalid: AtomicBool,
}

impl VmPool {
    pub(crate) fn new(
        key: DeployKey,
        source: &str,
        size: usize,
        memory_limit_bytes: usize,
        outbound: &Arc<OutboundClient>,
    ) -> Result<Arc<Self>, EngineError> {
        let mut idle = VecDeque::with_capacity(size);
        for slot in 0..size {
            match VmHost::new(source, memory_limit_bytes, outbound.clone()) {
                Ok(vm) => idle.push_back(vm),
                Err(e) => {
                    for vm in idle.drain(..) {
                        vm.close();
                    }
                    return Err(EngineError::PoolInit(format!(
                        "{key}: VM {slot} of {size}: {e}"
                    )));
                }
            }
        }
        debug!(key = %key, size, "pool warmed");
        Ok(Arc::new(Self {
            key,
            size,
            inner: Mutex::new(PoolInner {
                idle,
                outstanding: 0,
            }),
            available: Condvar::new(),
            invalid: AtomicBool::new(false),
        }))
    }

    /// Block until a VM is idle, FIFO among waiters, bounded by the
    /// caller's deadline. An invalidated pool never returns a VM.
    pub(crate) fn acquire(&self, deadline: Instant) -> Result<VmHost, AcquireError> {
        let mut inner = self.inner.lock();
        loop {
            if self.invalid.load(Ordering::Acquire) {
                return Err(AcquireError::Invalidated);
            }
            if let Some(vm) = inner.idle.pop_front() {
                inner.outstanding += 1;
                return Ok(vm);
            }
            if Instant::now() >= deadline {
                return Err(AcquireError::Timeout);
            }
            let _ = self.available.wait_until(&mut inner, deadline);
        }
    }

    /// Return a cleanly-finished VM. The event loop is reset before
    /// the VM re-enters the idle set; a dirty reset retires instead.
    pub(crate) fn release(&self, vm: VmHost) {
        if self.invalid.load(Ordering::Acquire) {
            self.retire(vm);
            return;
        }
        match vm.reset() {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.outstanding = inner.outstanding.saturating_sub(1);
                inner.idle.push_back(vm);
                drop(inner);
                self.available.notify_one();
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "reset failed, retiring VM");
                self.retire(vm);
            }
        }
    }

    /// Close a VM that timed out, faulted, or was interrupted, and
    /// mark the pool for rebuild.
    pub(crate) fn retire(&self, vm: VmHost) {
        self.invalid.store(true, Ordering::Release);
        {
            let mut inner = self.inner.lock();
            inner.outstanding = inner.outstanding.saturating_sub(1);
        }
        vm.close();
        // Wake waiters so they observe the invalidation.
        self.available.notify_all();
        debug!(key = %self.key, "VM retired, pool invalidated");
    }

    pub(crate) fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
        self.available.notify_all();
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Close all idle VMs. Checked-out VMs are retired by their
    /// holders when they observe the invalidation.
    pub(crate) fn dispose(&self) {
        self.invalidate();
        let drained: Vec<VmHost> = {
            let mut inner = self.inner.lock();
            inner.idle.drain(..).collect()
        };
        for vm in drained {
            vm.close();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for VmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPool")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("idle", &self.idle_count())
            .field("outstanding", &self.outstanding_count())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}
