//! Outbound effects for the Hornet worker engine.
//!
//! Everything a worker can make the host do on the network lives here:
//! `fetch()` dispatch with redirect handling and body transcoding, raw
//! TCP sockets for the `connect()` API, and fire-and-forget beacons.
//! All of it goes through the same two-layer SSRF defense: a URL
//! pre-check before anything is dispatched, and a connect-time
//! resolve-filter-pin step that defeats DNS rebinding between the
//! pre-check and the actual connection.

pub mod ssrf;

mod client;
mod socket;

pub use client::{
    CancelHandle, FetchOutcome, FetchPolicy, FetchSpec, OutboundClient, OutboundError,
    RedirectMode, FORBIDDEN_REQUEST_HEADERS,
};
pub use socket::{connect_checked, SocketError};
pub use ssrf::SsrfError;
