//! Per-execution request state.
//!
//! One `RequestState` is minted when a handler starts and cleared when
//! the execution ends, normally or not. Everything an in-flight
//! execution has open against the host lives here: the log capture,
//! the outbound-fetch quota counter, cancel handles for in-flight
//! dispatches, and the handle tables for stream effects and WebSocket
//! pairs. `clear()` tears all of it down, which is what makes abnormal
//! exits safe.

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hornet_bindings::{Environment, LogEntry, LogLevel};
use hornet_fetch::CancelHandle;
use parking_lot::Mutex;
use tracing::debug;

use crate::effects::{CompressionContext, DigestContext};

/// A message the worker's server-side WebSocket peer sent out.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Default)]
pub struct WsPair {
    pub accepted: bool,
    pub outgoing: VecDeque<WsMessage>,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub struct RequestState {
    id: u64,
    max_outbound: usize,
    outbound_count: AtomicUsize,
    env: Arc<Environment>,
    logs: Mutex<Vec<LogEntry>>,
    cancel_handles: Mutex<HashMap<u64, CancelHandle>>,
    digests: Mutex<HashMap<u64, DigestContext>>,
    compressions: Mutex<HashMap<u64, CompressionContext>>,
    sockets: Mutex<HashMap<u64, TcpStream>>,
    ws_pairs: Mutex<HashMap<u64, WsPair>>,
    next_handle: AtomicU64,
}

impl RequestState {
    pub fn new(max_outbound: usize, env: Arc<Environment>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            max_outbound,
            outbound_count: AtomicUsize::new(0),
            env,
            logs: Mutex::new(Vec::new()),
            cancel_handles: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
            compressions: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
            ws_pairs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn max_outbound(&self) -> usize {
        self.max_outbound
    }

    /// Claim one outbound-request slot. Fails once the quota is spent;
    /// the counter never exceeds the ceiling.
    pub fn try_take_outbound_slot(&self) -> bool {
        self.outbound_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.max_outbound).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound_count.load(Ordering::Relaxed)
    }

    pub fn push_log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.lock().push(LogEntry::new(level, message));
    }

    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs.lock())
    }

    pub fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_cancel_handle(&self, fetch_id: u64, handle: CancelHandle) {
        self.cancel_handles.lock().insert(fetch_id, handle);
    }

    pub fn remove_cancel_handle(&self, fetch_id: u64) -> Option<CancelHandle> {
        self.cancel_handles.lock().remove(&fetch_id)
    }

    /// Abort everything still in flight.
    pub fn cancel_inflight(&self) {
        for (_, handle) in self.cancel_handles.lock().drain() {
            handle.cancel();
        }
    }

    pub fn insert_digest(&self, ctx: DigestContext) -> u64 {
        let handle = self.next_handle();
        self.digests.lock().insert(handle, ctx);
        handle
    }

    pub fn with_digest<R>(&self, handle: u64, f: impl FnOnce(&mut DigestContext) -> R) -> Option<R> {
        self.digests.lock().get_mut(&handle).map(f)
    }

    pub fn take_digest(&self, handle: u64) -> Option<DigestContext> {
        self.digests.lock().remove(&handle)
    }

    pub fn insert_compression(&self, ctx: CompressionContext) -> u64 {
        let handle = self.next_handle();
        self.compressions.lock().insert(handle, ctx);
        handle
    }

    pub fn with_compression<R>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut CompressionContext) -> R,
    ) -> Option<R> {
        self.compressions.lock().get_mut(&handle).map(f)
    }

    pub fn take_compression(&self, handle: u64) -> Option<CompressionContext> {
        self.compressions.lock().remove(&handle)
    }

    pub fn insert_socket(&self, stream: TcpStream) -> u64 {
        let handle = self.next_handle();
        self.sockets.lock().insert(handle, stream);
        handle
    }

    pub fn clone_socket(&self, handle: u64) -> Option<TcpStream> {
        self.sockets.lock().get(&handle).and_then(|s| s.try_clone().ok())
    }

    pub fn close_socket(&self, handle: u64) -> bool {
        match self.sockets.lock().remove(&handle) {
            Some(stream) => {
                stream.shutdown(std::net::Shutdown::Both).ok();
                true
            }
            None => false,
        }
    }

    pub fn new_ws_pair(&self) -> u64 {
        let handle = self.next_handle();
        self.ws_pairs.lock().insert(handle, WsPair::default());
        handle
    }

    pub fn with_ws_pair<R>(&self, pair: u64, f: impl FnOnce(&mut WsPair) -> R) -> Option<R> {
        self.ws_pairs.lock().get_mut(&pair).map(f)
    }

    /// Whether the worker's server peer called `accept()`.
    pub fn ws_pair_accepted(&self, pair: u64) -> bool {
        self.ws_pairs
            .lock()
            .get(&pair)
            .map(|p| p.accepted)
            .unwrap_or(false)
    }

    /// Drain the messages the worker's server peer has sent.
    pub fn take_ws_outgoing(&self, pair: u64) -> Vec<WsMessage> {
        self.ws_pairs
            .lock()
            .get_mut(&pair)
            .map(|p| p.outgoing.drain(..).collect())
            .unwrap_or_default()
    }

    /// Tear down every open handle. Every registered cancel handle is
    /// invoked, sockets are shut down, and effect contexts are dropped.
    pub fn clear(&self) {
        self.cancel_inflight();
        for (_, stream) in self.sockets.lock().drain() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
        self.digests.lock().clear();
        self.compressions.lock().clear();
        self.ws_pairs.lock().clear();
        debug!(request_id = self.id, "request state cleared");
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        self.cancel_inflight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max: usize) -> Arc<RequestState> {
        RequestState::new(max, Arc::new(Environment::new()))
    }

    #[test]
    fn request_ids_are_unique() {
        let a = state(1);
        let b = state(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn outbound_counter_never_exceeds_quota() {
        let st = state(2);
        assert!(st.try_take_outbound_slot());
        assert!(st.try_take_outbound_slot());
        assert!(!st.try_take_outbound_slot());
        assert!(!st.try_take_outbound_slot());
        assert_eq!(st.outbound_count(), 2);
    }

    #[test]
    fn logs_capture_and_drain() {
        let st = state(1);
        st.push_log(LogLevel::Log, "one");
        st.push_log(LogLevel::Error, "two");
        let logs = st.take_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert!(st.take_logs().is_empty());
    }

    #[test]
    fn digest_handles_live_in_state() {
        let st = state(1);
        let h = st.insert_digest(DigestContext::new("SHA-256").unwrap());
        st.with_digest(h, |d| d.update(b"abc")).unwrap();
        let out = st.take_digest(h).unwrap().finish();
        assert_eq!(out.len(), 32);
        assert!(st.take_digest(h).is_none());
    }

    #[test]
    fn ws_pair_queues_outgoing() {
        let st = state(1);
        let pair = st.new_ws_pair();
        st.with_ws_pair(pair, |p| {
            p.accepted = true;
            p.outgoing.push_back(WsMessage::Text("hi".into()));
        });
        assert_eq!(st.take_ws_outgoing(pair), vec![WsMessage::Text("hi".into())]);
        assert!(st.take_ws_outgoing(pair).is_empty());
    }

    #[test]
    fn clear_drops_every_handle_table() {
        let st = state(1);
        let d = st.insert_digest(DigestContext::new("SHA-1").unwrap());
        let p = st.new_ws_pair();
        st.clear();
        assert!(st.take_digest(d).is_none());
        assert!(st.with_ws_pair(p, |_| ()).is_none());
    }
}
