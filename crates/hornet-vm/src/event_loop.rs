//! The per-VM event loop's bookkeeping: timers and pending outbound
//! I/O.
//!
//! The host holds no JS references. A timer entry is `{id, when,
//! interval}`; the callback lives in the JS-side `__timerCallbacks`
//! map under the same id. A pending-I/O entry is a correlation id and
//! the receiving end of a one-shot channel carrying an
//! already-serialized completion. Driving the loop (sleeping, firing,
//! delivering into JS) happens in `VmHost::drain`, on the VM's thread;
//! background workers only ever touch the sending ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use hornet_fetch::FetchOutcome;
use parking_lot::Mutex;

/// Repeating timers never fire more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub id: u64,
    pub when: Instant,
    pub interval: Option<Duration>,
}

/// Where a completion gets delivered: the JS functions the drain loop
/// invokes with `(id, payload)` / `(id, message)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoTarget {
    pub resolve_fn: &'static str,
    pub reject_fn: &'static str,
}

pub(crate) const FETCH_TARGET: IoTarget = IoTarget {
    resolve_fn: "__fetchResolve",
    reject_fn: "__fetchReject",
};
pub(crate) const BINDING_TARGET: IoTarget = IoTarget {
    resolve_fn: "__bindingResolve",
    reject_fn: "__bindingReject",
};
pub(crate) const SOCKET_TARGET: IoTarget = IoTarget {
    resolve_fn: "__socketResolve",
    reject_fn: "__socketReject",
};

pub(crate) enum IoChannel {
    /// An outbound HTTP dispatch; the outcome decides resolve/reject.
    Fetch(Receiver<FetchOutcome>),
    /// Anything already reduced to ok-JSON or an error message.
    Serialized(Receiver<Result<String, String>>),
}

pub(crate) struct PendingIo {
    pub id: u64,
    pub target: IoTarget,
    pub channel: IoChannel,
}

/// A completion ready to be handed to JS.
pub(crate) struct ReadyIo {
    pub id: u64,
    pub target: IoTarget,
    pub payload: Result<String, String>,
}

#[derive(Default)]
pub struct EventLoop {
    timers: Mutex<Vec<TimerEntry>>,
    pending: Mutex<Vec<PendingIo>>,
    /// Ids cleared while their entry was popped for firing. A
    /// repeating timer cancelled from inside its own callback lands
    /// here so the reschedule after the fire drops it.
    tombstones: Mutex<Vec<u64>>,
    next_timer_id: AtomicU64,
    next_io_id: AtomicU64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            tombstones: Mutex::new(Vec::new()),
            next_timer_id: AtomicU64::new(1),
            next_io_id: AtomicU64::new(1),
        }
    }

    /// Register a timer; repeating intervals clamp to [`MIN_INTERVAL`].
    pub fn register_timer(&self, delay: Duration, repeating: bool) -> u64 {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let interval = repeating.then(|| delay.max(MIN_INTERVAL));
        let delay = if repeating { delay.max(MIN_INTERVAL) } else { delay };
        self.timers.lock().push(TimerEntry {
            id,
            when: Instant::now() + delay,
            interval,
        });
        id
    }

    pub fn clear_timer(&self, id: u64) -> bool {
        let mut timers = self.timers.lock();
        match timers.iter().position(|t| t.id == id) {
            Some(index) => {
                timers.remove(index);
                true
            }
            None => {
                // Possibly mid-fire; make sure it does not reschedule.
                self.tombstones.lock().push(id);
                false
            }
        }
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.lock().iter().map(|t| t.when).min()
    }

    /// Pop the earliest timer that is due at `now`.
    pub(crate) fn pop_due_timer(&self, now: Instant) -> Option<TimerEntry> {
        let mut timers = self.timers.lock();
        let index = timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.when <= now)
            .min_by_key(|(_, t)| t.when)
            .map(|(i, _)| i)?;
        Some(timers.remove(index))
    }

    /// Put a fired repeating timer back on the wheel, unless it was
    /// cleared during the fire.
    pub(crate) fn reschedule(&self, timer: TimerEntry, interval: Duration) {
        {
            let mut tombstones = self.tombstones.lock();
            if let Some(index) = tombstones.iter().position(|&id| id == timer.id) {
                tombstones.swap_remove(index);
                return;
            }
        }
        self.timers.lock().push(TimerEntry {
            id: timer.id,
            when: Instant::now() + interval,
            interval: Some(interval),
        });
    }

    pub(crate) fn next_io_id(&self) -> u64 {
        self.next_io_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_io(&self, io: PendingIo) {
        self.pending.lock().push(io);
    }

    /// Drop a pending entry without delivering it (abort path).
    pub fn remove_io(&self, id: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p.id == id) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Non-blocking poll of every pending channel. Ready completions
    /// are removed and returned in registration order; disconnected
    /// channels (an aborted producer) are dropped silently.
    pub(crate) fn take_ready_io(&self) -> Vec<ReadyIo> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        pending.retain(|entry| {
            let polled = match &entry.channel {
                IoChannel::Fetch(rx) => match rx.try_recv() {
                    Ok(outcome) if outcome.ok => {
                        Some(Ok(serde_json::to_string(&outcome).unwrap_or_default()))
                    }
                    Ok(outcome) => Some(Err(outcome
                        .error
                        .unwrap_or_else(|| "fetch failed".to_string()))),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        return false;
                    }
                },
                IoChannel::Serialized(rx) => match rx.try_recv() {
                    Ok(result) => Some(result),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        return false;
                    }
                },
            };
            match polled {
                Some(payload) => {
                    ready.push(ReadyIo {
                        id: entry.id,
                        target: entry.target,
                        payload,
                    });
                    false
                }
                None => true,
            }
        });
        ready
    }

    pub fn has_pending_io(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending_io() || self.has_pending_timers()
    }

    /// Forget everything. Used by `reset()` between checkouts.
    pub fn clear(&self) {
        self.timers.lock().clear();
        self.pending.lock().clear();
        self.tombstones.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn timer_ids_are_monotonic() {
        let el = EventLoop::new();
        let a = el.register_timer(Duration::from_millis(1), false);
        let b = el.register_timer(Duration::from_millis(1), false);
        assert!(b > a);
    }

    #[test]
    fn repeating_interval_clamps_to_minimum() {
        let el = EventLoop::new();
        el.register_timer(Duration::from_millis(1), true);
        let timer = el.pop_due_timer(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(timer.interval, Some(MIN_INTERVAL));
    }

    #[test]
    fn one_shot_delay_is_not_clamped() {
        let el = EventLoop::new();
        el.register_timer(Duration::ZERO, false);
        assert!(el.pop_due_timer(Instant::now()).is_some());
    }

    #[test]
    fn clear_timer_removes_entry() {
        let el = EventLoop::new();
        let id = el.register_timer(Duration::from_secs(10), false);
        assert!(el.clear_timer(id));
        assert!(!el.clear_timer(id));
        assert!(!el.has_pending_timers());
    }

    #[test]
    fn earliest_due_timer_pops_first() {
        let el = EventLoop::new();
        let late = el.register_timer(Duration::from_millis(5), false);
        let early = el.register_timer(Duration::ZERO, false);
        let now = Instant::now() + Duration::from_millis(20);
        assert_eq!(el.pop_due_timer(now).unwrap().id, early);
        assert_eq!(el.pop_due_timer(now).unwrap().id, late);
        assert!(el.pop_due_timer(now).is_none());
    }

    #[test]
    fn interval_cleared_mid_fire_does_not_reschedule() {
        let el = EventLoop::new();
        let id = el.register_timer(Duration::ZERO, true);
        let timer = el.pop_due_timer(Instant::now() + Duration::from_secs(1)).unwrap();
        // Simulates clearInterval from inside the callback.
        el.clear_timer(id);
        el.reschedule(timer, MIN_INTERVAL);
        assert!(!el.has_pending_timers());
    }

    #[test]
    fn ready_io_is_removed_on_take() {
        let el = EventLoop::new();
        let (tx, rx) = bounded(1);
        let id = el.next_io_id();
        el.register_io(PendingIo {
            id,
            target: BINDING_TARGET,
            channel: IoChannel::Serialized(rx),
        });
        assert!(el.take_ready_io().is_empty(), "nothing sent yet");
        tx.send(Ok("{}".to_string())).unwrap();
        let ready = el.take_ready_io();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id);
        assert!(!el.has_pending_io());
    }

    #[test]
    fn disconnected_channel_is_dropped_silently() {
        let el = EventLoop::new();
        let (tx, rx) = bounded::<Result<String, String>>(1);
        el.register_io(PendingIo {
            id: el.next_io_id(),
            target: SOCKET_TARGET,
            channel: IoChannel::Serialized(rx),
        });
        drop(tx);
        assert!(el.take_ready_io().is_empty());
        assert!(!el.has_pending_io());
    }
}
