//! End-to-end dispatch tests against a loopback HTTP server.
//!
//! The SSRF defense rejects loopback, so every test here runs under
//! the permissive policy. SSRF behavior itself is covered by the unit
//! tests in `ssrf.rs`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use hornet_fetch::{FetchOutcome, FetchPolicy, FetchSpec, OutboundClient, RedirectMode};

/// Minimal HTTP/1.1 server: one response per connection, then close.
struct TestServer {
    port: u16,
}

impl TestServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { break };
                thread::spawn(move || handle(conn));
            }
        });
        Self { port }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}

fn handle(mut conn: TcpStream) {
    conn.set_read_timeout(Some(Duration::from_secs(5))).ok();
    let mut reader = BufReader::new(conn.try_clone().expect("clone"));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse().unwrap_or(0);
            }
            headers.push(format!("{}: {}", name, value.trim()));
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).ok();
    }

    let response = match path.as_str() {
        "/ok" => plain(200, "OK", "text/plain", b"ok"),
        "/echo-headers" => {
            let listing = headers.join("\n");
            plain(200, "OK", "text/plain", listing.as_bytes())
        }
        "/echo-body" => plain(200, "OK", "application/octet-stream", &body),
        "/redirect" => {
            b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec()
        }
        "/redirect-post" => {
            b"HTTP/1.1 303 See Other\r\nLocation: /ok\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec()
        }
        "/loop" => {
            b"HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec()
        }
        "/big" => plain(200, "OK", "text/plain", &vec![b'x'; 4096]),
        "/binary" => plain(200, "OK", "application/octet-stream", &[0u8, 159, 146, 150]),
        "/slow" => {
            thread::sleep(Duration::from_secs(5));
            plain(200, "OK", "text/plain", b"late")
        }
        _ => plain(404, "Not Found", "text/plain", b"nope"),
    };
    conn.write_all(&response).ok();
}

fn plain(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn client() -> OutboundClient {
    OutboundClient::new(FetchPolicy::permissive()).expect("outbound client")
}

fn fetch(client: &OutboundClient, spec: FetchSpec) -> FetchOutcome {
    let (rx, _cancel) = client.dispatch(spec);
    rx.recv_timeout(Duration::from_secs(10)).expect("outcome")
}

#[test]
fn basic_get() {
    let server = TestServer::start();
    let outcome = fetch(&client(), FetchSpec::get(server.url("/ok")));
    assert!(outcome.ok, "error: {:?}", outcome.error);
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.status_text, "OK");
    assert_eq!(outcome.body, "ok");
    assert!(!outcome.body_is_base64);
    assert!(!outcome.redirected);
}

#[test]
fn manual_redirect_returns_first_response() {
    let server = TestServer::start();
    let spec = FetchSpec {
        redirect: RedirectMode::Manual,
        ..FetchSpec::get(server.url("/redirect"))
    };
    let outcome = fetch(&client(), spec);
    assert_eq!(outcome.status, 302);
    assert_eq!(outcome.headers.get("location").map(String::as_str), Some("/next"));
    assert!(!outcome.redirected);
}

#[test]
fn follow_redirect_lands_on_target() {
    let server = TestServer::start();
    let outcome = fetch(&client(), FetchSpec::get(server.url("/redirect")));
    assert_eq!(outcome.status, 404, "redirect target /next is unmapped");
    assert!(outcome.redirected);
    assert!(outcome.url.ends_with("/next"));
}

#[test]
fn redirect_mode_error_rejects() {
    let server = TestServer::start();
    let spec = FetchSpec {
        redirect: RedirectMode::Error,
        ..FetchSpec::get(server.url("/redirect"))
    };
    let outcome = fetch(&client(), spec);
    assert!(!outcome.ok);
    assert_eq!(
        outcome.error.as_deref(),
        Some("fetch failed: redirect mode is 'error'")
    );
}

#[test]
fn redirect_loop_is_capped() {
    let server = TestServer::start();
    let outcome = fetch(&client(), FetchSpec::get(server.url("/loop")));
    assert!(!outcome.ok);
    assert!(outcome.error.unwrap().contains("redirects"));
}

#[test]
fn post_downgrades_through_303() {
    let server = TestServer::start();
    let spec = FetchSpec {
        method: "POST".to_string(),
        body: Some("payload".to_string()),
        ..FetchSpec::get(server.url("/redirect-post"))
    };
    let outcome = fetch(&client(), spec);
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "ok");
    assert!(outcome.redirected);
}

#[test]
fn forbidden_headers_are_stripped() {
    let server = TestServer::start();
    let mut headers = HashMap::new();
    headers.insert("x-forwarded-for".to_string(), "1.2.3.4".to_string());
    headers.insert("X-Real-IP".to_string(), "1.2.3.4".to_string());
    headers.insert("x-custom".to_string(), "kept".to_string());
    let spec = FetchSpec {
        headers,
        ..FetchSpec::get(server.url("/echo-headers"))
    };
    let outcome = fetch(&client(), spec);
    assert!(outcome.body.contains("x-custom: kept"));
    assert!(!outcome.body.contains("x-forwarded-for"));
    assert!(!outcome.body.contains("x-real-ip"));
}

#[test]
fn oversized_body_truncates_to_cap() {
    let server = TestServer::start();
    let mut policy = FetchPolicy::permissive();
    policy.max_response_bytes = 1000;
    let client = OutboundClient::new(policy).unwrap();
    let outcome = fetch(&client, FetchSpec::get(server.url("/big")));
    assert_eq!(outcome.body.len(), 1000);
}

#[test]
fn binary_body_crosses_as_base64() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let server = TestServer::start();
    let outcome = fetch(&client(), FetchSpec::get(server.url("/binary")));
    assert!(outcome.body_is_base64);
    let bytes = STANDARD.decode(&outcome.body).unwrap();
    assert_eq!(bytes, vec![0u8, 159, 146, 150]);
}

#[test]
fn binary_request_body_round_trips() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let server = TestServer::start();
    let payload = vec![1u8, 2, 3, 250];
    let spec = FetchSpec {
        method: "POST".to_string(),
        body: Some(STANDARD.encode(&payload)),
        body_is_binary: true,
        ..FetchSpec::get(server.url("/echo-body"))
    };
    let outcome = fetch(&client(), spec);
    assert!(outcome.body_is_base64);
    assert_eq!(STANDARD.decode(&outcome.body).unwrap(), payload);
}

#[test]
fn cancel_aborts_dispatch() {
    let server = TestServer::start();
    let client = client();
    let (rx, cancel) = client.dispatch(FetchSpec::get(server.url("/slow")));
    cancel.cancel();
    // The aborted task never delivers an outcome.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn ssrf_applies_under_default_policy() {
    let server = TestServer::start();
    let client = OutboundClient::new(FetchPolicy::default()).unwrap();
    let (rx, _cancel) = client.dispatch(FetchSpec::get(server.url("/ok")));
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!outcome.ok);
    assert!(outcome.error.unwrap().contains("private IP"));
}

#[test]
fn beacon_respects_precheck() {
    let server = TestServer::start();
    let strict = OutboundClient::new(FetchPolicy::default()).unwrap();
    assert!(!strict.send_beacon(&server.url("/ok"), b"b".to_vec()));
    let lax = client();
    assert!(lax.send_beacon(&server.url("/ok"), b"b".to_vec()));
}
