//! The `__host_*` native functions.
//!
//! Every callback takes the execution's request id as its first
//! argument where request state is involved, accepts and returns only
//! primitives and JSON strings, and never throws into JS: fallible
//! calls answer with an `{ok, ...}` envelope and the shims decide how
//! to surface failures. Callbacks never re-enter the VM; anything
//! asynchronous is parked in the event loop as pending I/O.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::bounded;
use hornet_bindings::LogLevel;
use hornet_fetch::{ssrf, FetchSpec};
use rand::RngCore;
use rquickjs::{Ctx, Function};
use serde_json::json;
use tracing::debug;

use crate::binding_call;
use crate::effects::{self, CompressionContext, DigestContext};
use crate::event_loop::{IoChannel, PendingIo, FETCH_TARGET, SOCKET_TARGET};
use crate::host::VmShared;
use crate::state::{RequestState, WsMessage};

pub(crate) fn env_ok(mut fields: serde_json::Value) -> String {
    if let Some(map) = fields.as_object_mut() {
        map.insert("ok".to_string(), json!(true));
    }
    fields.to_string()
}

pub(crate) fn env_err(kind: &str, message: impl Into<String>) -> String {
    json!({ "ok": false, "kind": kind, "error": message.into() }).to_string()
}

/// Resolve the current request state, insisting the caller's id
/// matches the bound execution.
pub(crate) fn current(
    shared: &Arc<VmShared>,
    request_id: u64,
) -> Result<Arc<RequestState>, String> {
    match shared.current.lock().clone() {
        Some(state) if state.id() == request_id => Ok(state),
        Some(_) => Err("request id does not match the active execution".to_string()),
        None => Err("no active execution".to_string()),
    }
}

fn decode_b64(data: &str) -> Result<Vec<u8>, String> {
    BASE64.decode(data).map_err(|e| format!("invalid base64: {e}"))
}

pub(crate) fn register(ctx: &Ctx<'_>, shared: &Arc<VmShared>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // Console capture. Lines land in the active request's log list;
    // outside an execution they go to tracing only.
    let st = shared.clone();
    globals.set(
        "__host_log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            match st.current.lock().clone() {
                Some(state) => state.push_log(LogLevel::from_console(&level), message),
                None => debug!(level = %level, "console (no execution): {message}"),
            }
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_now",
        Function::new(ctx.clone(), move || -> f64 {
            st.started.elapsed().as_secs_f64() * 1000.0
        })?,
    )?;

    // Timers. The JS callback stays in __timerCallbacks; only the id,
    // deadline and repeat flag live host-side.
    let st = shared.clone();
    globals.set(
        "__host_timer_register",
        Function::new(ctx.clone(), move |delay_ms: f64, repeat: bool| -> f64 {
            let delay = std::time::Duration::from_millis(delay_ms.max(0.0) as u64);
            st.event_loop.register_timer(delay, repeat) as f64
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_timer_clear",
        Function::new(ctx.clone(), move |id: f64| {
            st.event_loop.clear_timer(id as u64);
        })?,
    )?;

    globals.set(
        "__host_random",
        Function::new(ctx.clone(), move |count: f64| -> String {
            let len = (count.max(0.0) as usize).min(65_536);
            let mut bytes = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut bytes);
            BASE64.encode(bytes)
        })?,
    )?;

    globals.set(
        "__host_uuid",
        Function::new(ctx.clone(), move || -> String { random_uuid() })?,
    )?;

    globals.set(
        "__host_parse_url",
        Function::new(ctx.clone(), move |href: String, base: String| -> String {
            parse_url(&href, &base)
        })?,
    )?;

    // Outbound fetch: quota, pre-check, dispatch, pending-I/O entry.
    let st = shared.clone();
    globals.set(
        "__host_fetch",
        Function::new(ctx.clone(), move |request_id: f64, spec: String| -> String {
            host_fetch(&st, request_id as u64, &spec)
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_fetch_abort",
        Function::new(ctx.clone(), move |request_id: f64, fetch_id: f64| {
            let (request_id, fetch_id) = (request_id as u64, fetch_id as u64);
            if let Ok(state) = current(&st, request_id) {
                if let Some(handle) = state.remove_cancel_handle(fetch_id) {
                    handle.cancel();
                }
            }
            st.event_loop.remove_io(fetch_id);
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_binding",
        Function::new(ctx.clone(), move |request_id: f64, call: String| -> String {
            binding_call::dispatch(&st, request_id as u64, &call)
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_do_id",
        Function::new(
            ctx.clone(),
            move |request_id: f64, binding: String, name: String| -> String {
                match current(&st, request_id as u64) {
                    Ok(state) => match state.env().durable_objects.get(&binding) {
                        Some(ns) => env_ok(json!({ "id": ns.id_from_name(&name) })),
                        None => env_err(
                            "binding",
                            format!("durable object binding '{binding}' not found"),
                        ),
                    },
                    Err(e) => env_err("state", e),
                }
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_beacon",
        Function::new(
            ctx.clone(),
            move |request_id: f64, url: String, body_b64: String| -> bool {
                if current(&st, request_id as u64).is_err() {
                    return false;
                }
                let body = decode_b64(&body_b64).unwrap_or_default();
                st.outbound.send_beacon(&url, body)
            },
        )?,
    )?;

    // Digests: one-shot and incremental contexts.
    globals.set(
        "__host_digest",
        Function::new(ctx.clone(), move |algo: String, data_b64: String| -> String {
            match decode_b64(&data_b64) {
                Ok(data) => match effects::digest(&algo, &data) {
                    Some(out) => env_ok(json!({ "digest": BASE64.encode(out) })),
                    None => env_err("algo", format!("unsupported digest algorithm '{algo}'")),
                },
                Err(e) => env_err("type", e),
            }
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_digest_new",
        Function::new(ctx.clone(), move |request_id: f64, algo: String| -> String {
            match current(&st, request_id as u64) {
                Ok(state) => match DigestContext::new(&algo) {
                    Some(ctx_) => env_ok(json!({ "handle": state.insert_digest(ctx_) })),
                    None => env_err("algo", format!("unsupported digest algorithm '{algo}'")),
                },
                Err(e) => env_err("state", e),
            }
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_digest_update",
        Function::new(
            ctx.clone(),
            move |request_id: f64, handle: f64, data_b64: String| -> String {
                let state = match current(&st, request_id as u64) {
                    Ok(s) => s,
                    Err(e) => return env_err("state", e),
                };
                let data = match decode_b64(&data_b64) {
                    Ok(d) => d,
                    Err(e) => return env_err("type", e),
                };
                match state.with_digest(handle as u64, |d| d.update(&data)) {
                    Some(()) => env_ok(json!({})),
                    None => env_err("handle", "unknown digest handle"),
                }
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_digest_finish",
        Function::new(ctx.clone(), move |request_id: f64, handle: f64| -> String {
            let state = match current(&st, request_id as u64) {
                Ok(s) => s,
                Err(e) => return env_err("state", e),
            };
            match state.take_digest(handle as u64) {
                Some(d) => env_ok(json!({ "digest": BASE64.encode(d.finish()) })),
                None => env_err("handle", "unknown digest handle"),
            }
        })?,
    )?;

    // Compression: one-shot and incremental.
    globals.set(
        "__host_compress",
        Function::new(
            ctx.clone(),
            move |format: String, decompress: bool, data_b64: String| -> String {
                let data = match decode_b64(&data_b64) {
                    Ok(d) => d,
                    Err(e) => return env_err("type", e),
                };
                match effects::transform(&format, decompress, &data) {
                    Some(Ok(out)) => env_ok(json!({ "data": BASE64.encode(out) })),
                    Some(Err(e)) => env_err("io", e.to_string()),
                    None => env_err("algo", format!("unsupported compression format '{format}'")),
                }
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_compress_new",
        Function::new(
            ctx.clone(),
            move |request_id: f64, format: String, decompress: bool| -> String {
                match current(&st, request_id as u64) {
                    Ok(state) => match CompressionContext::new(&format, decompress) {
                        Some(ctx_) => env_ok(json!({ "handle": state.insert_compression(ctx_) })),
                        None => {
                            env_err("algo", format!("unsupported compression format '{format}'"))
                        }
                    },
                    Err(e) => env_err("state", e),
                }
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_compress_write",
        Function::new(
            ctx.clone(),
            move |request_id: f64, handle: f64, data_b64: String| -> String {
                let state = match current(&st, request_id as u64) {
                    Ok(s) => s,
                    Err(e) => return env_err("state", e),
                };
                let data = match decode_b64(&data_b64) {
                    Ok(d) => d,
                    Err(e) => return env_err("type", e),
                };
                match state.with_compression(handle as u64, |c| c.write(&data)) {
                    Some(Ok(())) => env_ok(json!({})),
                    Some(Err(e)) => env_err("io", e.to_string()),
                    None => env_err("handle", "unknown compression handle"),
                }
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_compress_finish",
        Function::new(ctx.clone(), move |request_id: f64, handle: f64| -> String {
            let state = match current(&st, request_id as u64) {
                Ok(s) => s,
                Err(e) => return env_err("state", e),
            };
            match state.take_compression(handle as u64) {
                Some(c) => match c.finish() {
                    Ok(out) => env_ok(json!({ "data": BASE64.encode(out) })),
                    Err(e) => env_err("io", e.to_string()),
                },
                None => env_err("handle", "unknown compression handle"),
            }
        })?,
    )?;

    // Raw TCP sockets: async connect/read/write through pending I/O.
    let st = shared.clone();
    globals.set(
        "__host_socket_connect",
        Function::new(
            ctx.clone(),
            move |request_id: f64, host: String, port: f64| -> String {
                socket_connect(&st, request_id as u64, host, port as u16)
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_socket_write",
        Function::new(
            ctx.clone(),
            move |request_id: f64, socket: f64, data_b64: String| -> String {
                socket_write(&st, request_id as u64, socket as u64, data_b64)
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_socket_read",
        Function::new(
            ctx.clone(),
            move |request_id: f64, socket: f64, max_bytes: f64| -> String {
                socket_read(&st, request_id as u64, socket as u64, max_bytes as usize)
            },
        )?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_socket_close",
        Function::new(ctx.clone(), move |request_id: f64, socket: f64| -> String {
            match current(&st, request_id as u64) {
                Ok(state) => {
                    state.close_socket(socket as u64);
                    env_ok(json!({}))
                }
                Err(e) => env_err("state", e),
            }
        })?,
    )?;

    // WebSocket pairs for upgrade hand-off.
    let st = shared.clone();
    globals.set(
        "__host_ws_pair",
        Function::new(ctx.clone(), move |request_id: f64| -> f64 {
            match current(&st, request_id as u64) {
                Ok(state) => state.new_ws_pair() as f64,
                Err(_) => 0.0,
            }
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_ws_accept",
        Function::new(ctx.clone(), move |request_id: f64, pair: f64| {
            if let Ok(state) = current(&st, request_id as u64) {
                state.with_ws_pair(pair as u64, |p| p.accepted = true);
            }
        })?,
    )?;

    let st = shared.clone();
    globals.set(
        "__host_ws_send",
        Function::new(
            ctx.clone(),
            move |request_id: f64, pair: f64, data: String, is_binary: bool| {
                if let Ok(state) = current(&st, request_id as u64) {
                    let message = if is_binary {
                        WsMessage::Binary(decode_b64(&data).unwrap_or_default())
                    } else {
                        WsMessage::Text(data)
                    };
                    state.with_ws_pair(pair as u64, |p| p.outgoing.push_back(message));
                }
            },
        )?,
    )?;

    Ok(())
}

fn host_fetch(shared: &Arc<VmShared>, request_id: u64, spec_json: &str) -> String {
    let state = match current(shared, request_id) {
        Ok(s) => s,
        Err(e) => return env_err("state", e),
    };

    // Quota first: a blocked fetch still consumes a slot.
    if !state.try_take_outbound_slot() {
        return env_err(
            "quota",
            format!(
                "exceeded maximum fetch requests ({} allowed)",
                state.max_outbound()
            ),
        );
    }

    let spec: FetchSpec = match serde_json::from_str(spec_json) {
        Ok(s) => s,
        Err(e) => return env_err("type", format!("malformed fetch request: {e}")),
    };

    if !shared.outbound.policy().allow_private_network {
        if let Err(e) = ssrf::precheck(&spec.url) {
            return env_err("ssrf", e.to_string());
        }
    }

    let (rx, cancel) = shared.outbound.dispatch(spec);
    let fetch_id = shared.event_loop.next_io_id();
    state.add_cancel_handle(fetch_id, cancel);
    shared.event_loop.register_io(PendingIo {
        id: fetch_id,
        target: FETCH_TARGET,
        channel: IoChannel::Fetch(rx),
    });
    env_ok(json!({ "fetchId": fetch_id }))
}

fn socket_connect(shared: &Arc<VmShared>, request_id: u64, host: String, port: u16) -> String {
    let state = match current(shared, request_id) {
        Ok(s) => s,
        Err(e) => return env_err("state", e),
    };

    let (tx, rx) = bounded(1);
    let call_id = shared.event_loop.next_io_id();
    shared.event_loop.register_io(PendingIo {
        id: call_id,
        target: SOCKET_TARGET,
        channel: IoChannel::Serialized(rx),
    });

    let timeout = shared.outbound.policy().timeout;
    let allow_private = shared.outbound.policy().allow_private_network;
    let state_for_task = state.clone();
    shared.outbound.handle().spawn_blocking(move || {
        let result = match hornet_fetch::connect_checked(&host, port, timeout, allow_private) {
            Ok(stream) => {
                let handle = state_for_task.insert_socket(stream);
                Ok(env_ok(json!({ "socketId": handle })))
            }
            Err(e) => Err(e.to_string()),
        };
        tx.send(result).ok();
    });

    env_ok(json!({ "callId": call_id }))
}

fn socket_write(shared: &Arc<VmShared>, request_id: u64, socket: u64, data_b64: String) -> String {
    let state = match current(shared, request_id) {
        Ok(s) => s,
        Err(e) => return env_err("state", e),
    };
    let data = match decode_b64(&data_b64) {
        Ok(d) => d,
        Err(e) => return env_err("type", e),
    };
    let Some(mut stream) = state.clone_socket(socket) else {
        return env_err("handle", "unknown socket handle");
    };

    let (tx, rx) = bounded(1);
    let call_id = shared.event_loop.next_io_id();
    shared.event_loop.register_io(PendingIo {
        id: call_id,
        target: SOCKET_TARGET,
        channel: IoChannel::Serialized(rx),
    });
    shared.outbound.handle().spawn_blocking(move || {
        use std::io::Write;
        let result = stream
            .write_all(&data)
            .map(|_| env_ok(json!({ "written": data.len() })))
            .map_err(|e| format!("socket write failed: {e}"));
        tx.send(result).ok();
    });
    env_ok(json!({ "callId": call_id }))
}

fn socket_read(shared: &Arc<VmShared>, request_id: u64, socket: u64, max_bytes: usize) -> String {
    let state = match current(shared, request_id) {
        Ok(s) => s,
        Err(e) => return env_err("state", e),
    };
    let Some(mut stream) = state.clone_socket(socket) else {
        return env_err("handle", "unknown socket handle");
    };

    let (tx, rx) = bounded(1);
    let call_id = shared.event_loop.next_io_id();
    shared.event_loop.register_io(PendingIo {
        id: call_id,
        target: SOCKET_TARGET,
        channel: IoChannel::Serialized(rx),
    });
    let cap = max_bytes.clamp(1, 1 << 20);
    shared.outbound.handle().spawn_blocking(move || {
        use std::io::Read;
        let mut buffer = vec![0u8; cap];
        let result = match stream.read(&mut buffer) {
            Ok(0) => Ok(env_ok(json!({ "dataB64": "", "eof": true }))),
            Ok(n) => Ok(env_ok(
                json!({ "dataB64": BASE64.encode(&buffer[..n]), "eof": false }),
            )),
            Err(e) => Err(format!("socket read failed: {e}")),
        };
        tx.send(result).ok();
    });
    env_ok(json!({ "callId": call_id }))
}

fn parse_url(href: &str, base: &str) -> String {
    let parsed = if base.is_empty() {
        url::Url::parse(href)
    } else {
        match url::Url::parse(base) {
            Ok(b) => b.join(href),
            Err(e) => return env_err("url", e.to_string()),
        }
    };
    match parsed {
        Ok(u) => {
            let port = u.port().map(|p| p.to_string()).unwrap_or_default();
            let host = u.host_str().unwrap_or("");
            let host_port = if port.is_empty() {
                host.to_string()
            } else {
                format!("{host}:{port}")
            };
            env_ok(json!({
                "url": {
                    "href": u.as_str(),
                    "protocol": format!("{}:", u.scheme()),
                    "host": host_port,
                    "hostname": host,
                    "port": port,
                    "pathname": u.path(),
                    "search": u.query().map(|q| format!("?{q}")).unwrap_or_default(),
                    "hash": u.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
                    "origin": u.origin().ascii_serialization(),
                    "username": u.username(),
                    "password": u.password().unwrap_or(""),
                }
            }))
        }
        Err(e) => env_err("url", e.to_string()),
    }
}

fn random_uuid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_carry_ok_flag() {
        let ok = env_ok(json!({ "x": 1 }));
        assert!(ok.contains(r#""ok":true"#));
        let err = env_err("quota", "too many");
        assert!(err.contains(r#""ok":false"#));
        assert!(err.contains(r#""kind":"quota""#));
    }

    #[test]
    fn uuid_shape() {
        let id = random_uuid();
        assert_eq!(id.len(), 36);
        assert_eq!(id.as_bytes()[14], b'4');
        assert_eq!(&id[8..9], "-");
    }

    #[test]
    fn parse_url_fields() {
        let raw = parse_url("https://user:pw@example.com:8443/a/b?x=1#frag", "");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["ok"], true);
        let u = &v["url"];
        assert_eq!(u["protocol"], "https:");
        assert_eq!(u["hostname"], "example.com");
        assert_eq!(u["port"], "8443");
        assert_eq!(u["pathname"], "/a/b");
        assert_eq!(u["search"], "?x=1");
        assert_eq!(u["hash"], "#frag");
        assert_eq!(u["username"], "user");
    }

    #[test]
    fn parse_url_with_base() {
        let raw = parse_url("/next", "http://example.com/prev");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["url"]["href"], "http://example.com/next");
    }

    #[test]
    fn parse_url_rejects_garbage() {
        let raw = parse_url("::::", "");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["ok"], false);
    }
}
