//! The wall-clock watchdog for one execution.
//!
//! A named thread parks until the deadline. If the execution has not
//! disarmed it by then, it marks the timeout, aborts every in-flight
//! fetch through the request state's cancel handles, and interrupts
//! the VM. After an interrupt the VM is always retired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hornet_vm::{InterruptHandle, RequestState};
use tracing::debug;

const TICK: Duration = Duration::from_millis(5);

pub(crate) struct Watchdog {
    timed_out: Arc<AtomicBool>,
    disarmed: Arc<AtomicBool>,
}

impl Watchdog {
    pub(crate) fn arm(
        interrupt: InterruptHandle,
        state: Arc<RequestState>,
        deadline: Instant,
    ) -> Self {
        let timed_out = Arc::new(AtomicBool::new(false));
        let disarmed = Arc::new(AtomicBool::new(false));

        let fired = timed_out.clone();
        let stop = disarmed.clone();
        std::thread::Builder::new()
            .name("hornet-watchdog".to_string())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(TICK.min(deadline - now));
                }
                if stop.load(Ordering::Acquire) {
                    return;
                }
                fired.store(true, Ordering::Release);
                debug!(request_id = state.id(), "watchdog fired");
                state.cancel_inflight();
                interrupt.interrupt();
            })
            .expect("failed to spawn watchdog thread");

        Self {
            timed_out,
            disarmed,
        }
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn disarm(&self) {
        self.disarmed.store(true, Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_bindings::Environment;
    use hornet_fetch::{FetchPolicy, OutboundClient};
    use hornet_vm::VmHost;

    fn idle_vm() -> VmHost {
        let outbound = Arc::new(OutboundClient::new(FetchPolicy::permissive()).unwrap());
        VmHost::new("export default {};", 32 * 1024 * 1024, outbound).unwrap()
    }

    #[test]
    fn disarmed_watchdog_never_fires() {
        let vm = idle_vm();
        let state = RequestState::new(1, Arc::new(Environment::new()));
        let dog = Watchdog::arm(
            vm.interrupt_handle(),
            state,
            Instant::now() + Duration::from_millis(30),
        );
        dog.disarm();
        std::thread::sleep(Duration::from_millis(60));
        assert!(!dog.timed_out());
        assert!(!vm.is_interrupted());
    }

    #[test]
    fn expired_watchdog_interrupts_vm() {
        let vm = idle_vm();
        let state = RequestState::new(1, Arc::new(Environment::new()));
        let dog = Watchdog::arm(
            vm.interrupt_handle(),
            state,
            Instant::now() + Duration::from_millis(10),
        );
        std::thread::sleep(Duration::from_millis(60));
        assert!(dog.timed_out());
        assert!(vm.is_interrupted());
    }
}
