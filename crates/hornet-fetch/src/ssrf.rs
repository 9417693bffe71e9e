//! SSRF protection: the URL pre-check and the address filter used at
//! connect time.
//!
//! The pre-check rejects URLs whose host is a literal private address
//! or a local hostname before any request is built. Because DNS can
//! change between the pre-check and the connection, the dialing side
//! resolves the hostname itself, drops every private address from the
//! answer set, and pins the first survivor into the HTTP client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use thiserror::Error;
use url::{Host, Url};

/// Why a URL or address was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not fetchable")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    /// The host is a literal private IP address.
    #[error("'{0}' is a private IP address")]
    PrivateAddress(String),

    /// The hostname names the local machine (`localhost`, `*.localhost`).
    #[error("hostname '{0}' maps to a private IP address")]
    LocalHostname(String),

    /// DNS answered, but every address in the answer set was private.
    #[error("hostname '{0}' resolved only to private IP addresses")]
    NoPublicAddress(String),

    #[error("failed to resolve '{0}': {1}")]
    ResolveFailed(String, String),
}

/// Validate a URL literal before any request is built.
///
/// Accepts only `http`/`https`, rejects hosts that are literal private
/// IPs or local hostnames. Returns the parsed URL so callers do not
/// parse twice.
pub fn precheck(raw: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::UnsupportedScheme(other.to_string())),
    }

    match url.host() {
        None => Err(SsrfError::MissingHost),
        Some(Host::Ipv4(addr)) if is_private_v4(addr) => {
            Err(SsrfError::PrivateAddress(addr.to_string()))
        }
        Some(Host::Ipv6(addr)) if is_private_v6(&addr) => {
            Err(SsrfError::PrivateAddress(addr.to_string()))
        }
        Some(Host::Domain(name)) if is_local_hostname(name) => {
            Err(SsrfError::LocalHostname(name.to_string()))
        }
        Some(_) => Ok(url),
    }
}

/// True for `localhost` and any `*.localhost` name, case-insensitive.
pub fn is_local_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host.eq_ignore_ascii_case("localhost")
        || host
            .rsplit_once('.')
            .is_some_and(|(_, tld)| tld.eq_ignore_ascii_case("localhost"))
}

/// True if the address lies in any range a worker must not reach.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(*v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // Benchmarking 198.18.0.0/15
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // IETF protocol assignments 192.0.0.0/24
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // Reserved 240.0.0.0/4
        || octets[0] >= 240
}

fn is_private_v6(addr: &Ipv6Addr) -> bool {
    // An IPv4-mapped address is as private as the IPv4 address it wraps.
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let segments = addr.segments();
    addr.is_unspecified()
        || addr.is_loopback()
        // Unique-local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // Link-local fe80::/10 and deprecated site-local fec0::/10
        || (segments[0] & 0xffc0) == 0xfe80
        || (segments[0] & 0xffc0) == 0xfec0
        // Documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        // Benchmarking 2001:2::/48
        || (segments[0] == 0x2001 && segments[1] == 0x0002 && segments[2] == 0)
}

/// Drop every private address from a resolved answer set.
pub fn filter_public<I>(addrs: I) -> Vec<SocketAddr>
where
    I: IntoIterator<Item = SocketAddr>,
{
    addrs
        .into_iter()
        .filter(|a| !is_private_ip(&a.ip()))
        .collect()
}

/// Resolve `host:port` and return the first address that survives the
/// private-range filter. This is the connect-time half of the defense;
/// callers pin the returned address so the connection cannot
/// re-resolve to something else.
pub fn resolve_public(host: &str, port: u16) -> Result<SocketAddr, SsrfError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(SsrfError::PrivateAddress(host.to_string()));
        }
        return Ok(SocketAddr::new(ip, port));
    }
    if is_local_hostname(host) {
        return Err(SsrfError::LocalHostname(host.to_string()));
    }

    let answers = (host, port)
        .to_socket_addrs()
        .map_err(|e| SsrfError::ResolveFailed(host.to_string(), e.to_string()))?;
    let mut survivors = filter_public(answers);
    if survivors.is_empty() {
        return Err(SsrfError::NoPublicAddress(host.to_string()));
    }
    Ok(survivors.remove(0))
}
