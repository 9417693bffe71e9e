//! The VM side of the Hornet worker engine.
//!
//! One [`VmHost`] is one sandboxed QuickJS context plus its host-side
//! state: the cooperative event loop, the per-execution request state
//! slot, and the host callbacks the runtime shims are built on. The
//! engine crate checks hosts out of pools and drives them; everything
//! in here runs on the thread that holds the checkout, except for
//! [`InterruptHandle::interrupt`], which is the single cross-thread
//! operation.

mod binding_call;
mod bridge;
pub mod effects;
mod error;
mod event_loop;
mod host;
mod hostcalls;
pub mod marshal;
mod shims;
mod state;

pub use bridge::{AwaitOutcome, InvokeStatus};
pub use error::{VmError, VmResult};
pub use event_loop::{EventLoop, MIN_INTERVAL};
pub use host::{InterruptHandle, VmHost};
pub use state::{RequestState, WsMessage, WsPair};
