//! Raw TCP dial for the worker-facing `connect()` API.
//!
//! Same defense as the HTTP path: resolve, drop private answers, dial
//! the first survivor. The stream itself is a plain std `TcpStream`
//! with read/write timeouts; the VM side does all I/O through host
//! calls, so nothing async is needed here.

use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::ssrf::{self, SsrfError};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error(transparent)]
    Blocked(#[from] SsrfError),

    #[error("connect to {0}:{1} failed: {2}")]
    Connect(String, u16, std::io::Error),
}

/// Dial `host:port` with the connect-time SSRF defense applied.
pub fn connect_checked(
    host: &str,
    port: u16,
    timeout: Duration,
    allow_private: bool,
) -> Result<TcpStream, SocketError> {
    let addr = if allow_private {
        use std::net::ToSocketAddrs;
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut a| a.next())
            .ok_or_else(|| {
                SsrfError::ResolveFailed(host.to_string(), "no addresses".to_string())
            })?
    } else {
        ssrf::resolve_public(host, port)?
    };

    debug!(host = %host, addr = %addr, "dialing socket");
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| SocketError::Connect(host.to_string(), port, e))?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();
    Ok(stream)
}
