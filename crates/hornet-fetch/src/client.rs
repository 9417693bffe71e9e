//! Cancellable outbound HTTP dispatch.
//!
//! The client owns a small tokio runtime; every dispatch runs as a
//! task on it and delivers exactly one fully-serialized [`FetchOutcome`]
//! through a bounded crossbeam channel. The consumer side of that
//! channel is the VM's event loop, which polls it without blocking.
//! Redirects are walked manually so each hop gets its own SSRF check
//! and its own pinned address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::ssrf::{self, SsrfError};

/// Request headers the host always strips before dispatch (lowercased).
pub const FORBIDDEN_REQUEST_HEADERS: &[&str] = &[
    "host",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
];

const MAX_REDIRECTS: u32 = 20;

/// How the dispatcher treats 3xx responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    #[default]
    Follow,
    Manual,
    Error,
}

/// Per-engine outbound policy.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Hard timeout for a single outbound request, all hops included.
    pub timeout: Duration,
    /// Response bodies are truncated to this many bytes.
    pub max_response_bytes: usize,
    /// Skip the SSRF checks entirely. Test servers live on loopback;
    /// production engines never set this.
    pub allow_private_network: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_response_bytes: 10 * 1024 * 1024,
            allow_private_network: false,
        }
    }
}

impl FetchPolicy {
    /// Policy with SSRF checks disabled, for tests against loopback.
    pub fn permissive() -> Self {
        Self {
            allow_private_network: true,
            ..Self::default()
        }
    }
}

/// One outbound request, extracted JS-side and deserialized here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchSpec {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub body_is_binary: bool,
    pub redirect: RedirectMode,
}

impl Default for FetchSpec {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            body_is_binary: false,
            redirect: RedirectMode::Follow,
        }
    }
}

impl FetchSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// The fully-serialized completion of one dispatch. Everything the VM
/// needs is a string or a number; the event loop never touches
/// structured host data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// UTF-8 text, or base64 when `body_is_base64` is set.
    pub body: String,
    pub body_is_base64: bool,
    /// Final URL after any followed redirects.
    pub url: String,
    pub redirected: bool,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn failure(url: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: 0,
            status_text: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            body_is_base64: false,
            url: url.to_string(),
            redirected: false,
            error: Some(message.into()),
        }
    }
}

/// Aborts the in-flight dispatch when invoked. Held in request state
/// and shared with nothing but the watchdog.
#[derive(Debug)]
pub struct CancelHandle {
    task: JoinHandle<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("failed to start outbound runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Owns the tokio runtime all outbound work runs on.
pub struct OutboundClient {
    runtime: tokio::runtime::Runtime,
    policy: FetchPolicy,
}

impl OutboundClient {
    pub fn new(policy: FetchPolicy) -> Result<Self, OutboundError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hornet-outbound")
            .enable_all()
            .build()?;
        Ok(Self { runtime, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Start one dispatch. The returned receiver yields exactly one
    /// outcome unless the handle is cancelled first.
    pub fn dispatch(&self, spec: FetchSpec) -> (Receiver<FetchOutcome>, CancelHandle) {
        let (tx, rx) = bounded(1);
        let policy = self.policy.clone();
        let task = self.runtime.spawn(async move {
            let url = spec.url.clone();
            let outcome = run_fetch(spec, &policy).await;
            if tx.send(outcome).is_err() {
                debug!(url = %url, "fetch completed after its execution ended");
            }
        });
        (rx, CancelHandle { task })
    }

    /// Fire-and-forget POST. Returns whether the beacon was accepted
    /// for delivery; delivery failures are invisible by contract.
    pub fn send_beacon(&self, url: &str, body: Vec<u8>) -> bool {
        if !self.policy.allow_private_network && ssrf::precheck(url).is_err() {
            return false;
        }
        let spec = FetchSpec {
            url: url.to_string(),
            method: "POST".to_string(),
            body: Some(BASE64.encode(body)),
            body_is_binary: true,
            redirect: RedirectMode::Follow,
            ..FetchSpec::default()
        };
        let policy = self.policy.clone();
        self.runtime.spawn(async move {
            let outcome = run_fetch(spec, &policy).await;
            if let Some(err) = outcome.error {
                debug!(url = %outcome.url, error = %err, "beacon delivery failed");
            }
        });
        true
    }

    /// Handle to the outbound runtime, for effects that need their own
    /// tasks (sockets, binding calls).
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }
}

async fn run_fetch(spec: FetchSpec, policy: &FetchPolicy) -> FetchOutcome {
    match tokio::time::timeout(policy.timeout, follow_hops(&spec, policy)).await {
        Ok(outcome) => outcome,
        Err(_) => FetchOutcome::failure(
            &spec.url,
            format!("fetch timed out after {}ms", policy.timeout.as_millis()),
        ),
    }
}

/// Walk the redirect chain, one pinned connection per hop.
async fn follow_hops(spec: &FetchSpec, policy: &FetchPolicy) -> FetchOutcome {
    let mut current = match Url::parse(&spec.url) {
        Ok(u) => u,
        Err(e) => return FetchOutcome::failure(&spec.url, format!("invalid URL: {e}")),
    };
    let mut method = spec.method.to_uppercase();
    let mut body = match decode_body(spec) {
        Ok(b) => b,
        Err(msg) => return FetchOutcome::failure(&spec.url, msg),
    };
    let mut redirected = false;

    for hop in 0..=MAX_REDIRECTS {
        let response = match send_one(&current, &method, &spec.headers, body.clone(), policy).await
        {
            Ok(r) => r,
            Err(msg) => return FetchOutcome::failure(current.as_str(), msg),
        };

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_redirection() || location.is_none() {
            return materialize(response, current.as_str(), redirected, policy).await;
        }

        match spec.redirect {
            RedirectMode::Manual => {
                return materialize(response, current.as_str(), false, policy).await;
            }
            RedirectMode::Error => {
                return FetchOutcome::failure(
                    current.as_str(),
                    "fetch failed: redirect mode is 'error'",
                );
            }
            RedirectMode::Follow => {
                if hop == MAX_REDIRECTS {
                    return FetchOutcome::failure(
                        current.as_str(),
                        format!("fetch failed: more than {MAX_REDIRECTS} redirects"),
                    );
                }
                let target = location.unwrap();
                current = match current.join(&target) {
                    Ok(u) => u,
                    Err(e) => {
                        return FetchOutcome::failure(
                            current.as_str(),
                            format!("invalid redirect target '{target}': {e}"),
                        );
                    }
                };
                // 303, and 301/302 on a POST, downgrade to a bodyless GET.
                let code = status.as_u16();
                if code == 303 || ((code == 301 || code == 302) && method == "POST") {
                    method = "GET".to_string();
                    body = None;
                }
                redirected = true;
                debug!(url = %current, hop = hop + 1, "following redirect");
            }
        }
    }

    unreachable!("redirect loop is bounded");
}

async fn send_one(
    url: &Url,
    method: &str,
    headers: &HashMap<String, String>,
    body: Option<Vec<u8>>,
    policy: &FetchPolicy,
) -> Result<reqwest::Response, String> {
    if !policy.allow_private_network {
        ssrf::precheck(url.as_str()).map_err(|e| e.to_string())?;
    }

    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(policy.timeout);

    if !policy.allow_private_network {
        if let Some(pinned) = resolve_and_pin(url).await? {
            builder = builder.resolve(url.host_str().unwrap_or_default(), pinned);
        }
    }

    let client = builder
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("unsupported HTTP method: {method}"))?;
    let mut request = client.request(method, url.clone());

    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if FORBIDDEN_REQUEST_HEADERS.contains(&lowered.as_str()) {
            warn!(header = %lowered, "stripping forbidden request header");
            continue;
        }
        request = request.header(&lowered, value);
    }
    if let Some(bytes) = body {
        request = request.body(bytes);
    }

    request
        .send()
        .await
        .map_err(|e| format!("fetch failed: {e}"))
}

/// Resolve the hostname inside the request deadline, drop private
/// answers, and return the address to pin. Literal-IP hosts were
/// already vetted by the pre-check and need no pinning.
async fn resolve_and_pin(url: &Url) -> Result<Option<SocketAddr>, String> {
    let host = match url.host() {
        Some(url::Host::Domain(d)) => d.to_string(),
        _ => return Ok(None),
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let answers = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| SsrfError::ResolveFailed(host.clone(), e.to_string()).to_string())?;
    let mut survivors = ssrf::filter_public(answers);
    if survivors.is_empty() {
        return Err(SsrfError::NoPublicAddress(host).to_string());
    }
    Ok(Some(survivors.remove(0)))
}

async fn materialize(
    response: reqwest::Response,
    url: &str,
    redirected: bool,
    policy: &FetchPolicy,
) -> FetchOutcome {
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let final_url = response.url().to_string();

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let content_type = headers.get("content-type").cloned().unwrap_or_default();

    let mut bytes = match response.bytes().await {
        Ok(b) => b.to_vec(),
        Err(e) => return FetchOutcome::failure(url, format!("failed to read body: {e}")),
    };
    if bytes.len() > policy.max_response_bytes {
        bytes.truncate(policy.max_response_bytes);
    }

    let (body, body_is_base64) = if is_textual(&content_type) {
        match String::from_utf8(bytes) {
            Ok(text) => (text, false),
            Err(e) => (BASE64.encode(e.into_bytes()), true),
        }
    } else {
        (BASE64.encode(&bytes), true)
    };

    FetchOutcome {
        ok: true,
        status: status.as_u16(),
        status_text,
        headers,
        body,
        body_is_base64,
        url: final_url,
        redirected,
        error: None,
    }
}

fn decode_body(spec: &FetchSpec) -> Result<Option<Vec<u8>>, String> {
    match &spec.body {
        None => Ok(None),
        Some(text) if !spec.body_is_binary => Ok(Some(text.clone().into_bytes())),
        Some(encoded) => BASE64
            .decode(encoded)
            .map(Some)
            .map_err(|e| format!("invalid binary body: {e}")),
    }
}

/// Empty content types and anything string-shaped counts as text; the
/// rest crosses the bridge as base64.
fn is_textual(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.is_empty()
        || ct.starts_with("text/")
        || ct.ends_with("/json")
        || ct.ends_with("+json")
        || ct.ends_with("/javascript")
        || ct.ends_with("/ecmascript")
        || ct.ends_with("+xml")
        || ct.ends_with("/xml")
        || ct == "application/x-www-form-urlencoded"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_spec_defaults() {
        let spec: FetchSpec = serde_json::from_str(r#"{"url":"http://example.com/"}"#).unwrap();
        assert_eq!(spec.method, "GET");
        assert_eq!(spec.redirect, RedirectMode::Follow);
        assert!(spec.headers.is_empty());
        assert!(spec.body.is_none());
    }

    #[test]
    fn fetch_spec_parses_redirect_modes() {
        for (raw, mode) in [
            ("follow", RedirectMode::Follow),
            ("manual", RedirectMode::Manual),
            ("error", RedirectMode::Error),
        ] {
            let json = format!(r#"{{"url":"http://h/","redirect":"{raw}"}}"#);
            let spec: FetchSpec = serde_json::from_str(&json).unwrap();
            assert_eq!(spec.redirect, mode);
        }
    }

    #[test]
    fn textual_content_types() {
        assert!(is_textual("text/html; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/ld+json"));
        assert!(is_textual("application/xml"));
        assert!(is_textual("image/svg+xml"));
        assert!(is_textual(""));
        assert!(!is_textual("application/octet-stream"));
        assert!(!is_textual("image/png"));
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = FetchOutcome::failure("http://h/", "nope");
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""statusText""#));
        assert!(json.contains(r#""bodyIsBase64""#));
        assert!(json.contains(r#""redirected":false"#));
    }

    #[test]
    fn forbidden_set_is_lowercase() {
        for name in FORBIDDEN_REQUEST_HEADERS {
            assert_eq!(*name, name.to_ascii_lowercase());
        }
    }
}
