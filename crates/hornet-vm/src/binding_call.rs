//! Platform-binding calls from JS.
//!
//! One generic entry point serves every binding kind: the shim sends
//! `{kind, name, op, args}`, the host resolves the binding from the
//! execution's environment, runs the trait method on the outbound
//! worker pool, and delivers the serialized result through the
//! pending-I/O path like any other completion.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::bounded;
use hornet_bindings::{DispatchOutcome, Environment, HostRequest, HostResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::event_loop::{IoChannel, PendingIo, BINDING_TARGET};
use crate::host::VmShared;
use crate::hostcalls::{current, env_err, env_ok};

#[derive(Debug, Deserialize)]
struct BindingCall {
    kind: String,
    #[serde(default)]
    name: String,
    op: String,
    #[serde(default)]
    args: Vec<Value>,
}

/// Request/response forms as they cross the bridge.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireRequest {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body_b64: String,
}

impl WireRequest {
    fn into_host(self) -> Result<HostRequest, String> {
        let body = if self.body_b64.is_empty() {
            Vec::new()
        } else {
            BASE64
                .decode(&self.body_b64)
                .map_err(|e| format!("invalid request body: {e}"))?
        };
        let mut headers = HashMap::new();
        for (name, value) in self.headers {
            headers.insert(name.to_ascii_lowercase(), value);
        }
        Ok(HostRequest {
            method: if self.method.is_empty() {
                "GET".to_string()
            } else {
                self.method
            },
            url: self.url,
            headers,
            body,
        })
    }
}

fn wire_response(response: &HostResponse) -> Value {
    json!({
        "status": response.status,
        "statusText": response.status_text,
        "headers": response.headers,
        "bodyB64": BASE64.encode(&response.body),
    })
}

/// Entry point from `__host_binding`.
pub(crate) fn dispatch(shared: &Arc<VmShared>, request_id: u64, call_json: &str) -> String {
    let state = match current(shared, request_id) {
        Ok(s) => s,
        Err(e) => return env_err("state", e),
    };
    let call: BindingCall = match serde_json::from_str(call_json) {
        Ok(c) => c,
        Err(e) => return env_err("type", format!("malformed binding call: {e}")),
    };

    let env = state.env().clone();
    let (tx, rx) = bounded(1);
    let call_id = shared.event_loop.next_io_id();
    shared.event_loop.register_io(PendingIo {
        id: call_id,
        target: BINDING_TARGET,
        channel: IoChannel::Serialized(rx),
    });
    shared.outbound.handle().spawn_blocking(move || {
        let result = run(&env, call);
        tx.send(result).ok();
    });
    env_ok(json!({ "callId": call_id }))
}

fn run(env: &Arc<Environment>, call: BindingCall) -> Result<String, String> {
    match call.kind.as_str() {
        "kv" => kv(env, &call),
        "d1" => d1(env, &call),
        "queue" => queue(env, &call),
        "bucket" => bucket(env, &call),
        "do" => durable_object(env, &call),
        "service" => service(env, &call),
        "assets" => assets(env, &call),
        "cache" => cache(env, &call),
        other => Err(format!("unknown binding kind '{other}'")),
    }
}

fn arg(call: &BindingCall, index: usize) -> Value {
    call.args.get(index).cloned().unwrap_or(Value::Null)
}

fn arg_str(call: &BindingCall, index: usize) -> Result<String, String> {
    match arg(call, index) {
        Value::String(s) => Ok(s),
        other => Err(format!(
            "argument {index} of {}.{} must be a string, got {other}",
            call.kind, call.op
        )),
    }
}

fn arg_opt_str(call: &BindingCall, index: usize) -> Option<String> {
    match arg(call, index) {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn arg_opt_u64(call: &BindingCall, index: usize) -> Option<u64> {
    arg(call, index).as_u64()
}

fn arg_request(call: &BindingCall, index: usize) -> Result<HostRequest, String> {
    let wire: WireRequest = serde_json::from_value(arg(call, index))
        .map_err(|e| format!("malformed request argument: {e}"))?;
    wire.into_host()
}

fn kv(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let store = env
        .kv
        .get(&call.name)
        .ok_or_else(|| format!("kv binding '{}' not found", call.name))?;
    match call.op.as_str() {
        "get" => {
            let value = store
                .get(&arg_str(call, 0)?)
                .map_err(|e| e.to_string())?;
            Ok(json!({ "value": value }).to_string())
        }
        "put" => {
            let key = arg_str(call, 0)?;
            let value = arg_str(call, 1)?;
            store
                .put(&key, value, arg_opt_u64(call, 2))
                .map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "delete" => {
            store
                .delete(&arg_str(call, 0)?)
                .map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "list" => {
            let prefix = arg_opt_str(call, 0);
            let limit = arg_opt_u64(call, 1).unwrap_or(1000) as usize;
            let cursor = arg_opt_str(call, 2);
            let page = store
                .list(prefix.as_deref(), limit, cursor.as_deref())
                .map_err(|e| e.to_string())?;
            serde_json::to_string(&page).map_err(|e| e.to_string())
        }
        other => Err(format!("unknown kv operation '{other}'")),
    }
}

fn d1(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let db = env
        .d1
        .get(&call.name)
        .ok_or_else(|| format!("d1 binding '{}' not found", call.name))?;
    match call.op.as_str() {
        "query" => {
            let sql = arg_str(call, 0)?;
            let params = match arg(call, 1) {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => return Err(format!("query parameters must be an array, got {other}")),
            };
            let result = db.query(&sql, &params).map_err(|e| e.to_string())?;
            serde_json::to_string(&result).map_err(|e| e.to_string())
        }
        "exec" => {
            let count = db.exec(&arg_str(call, 0)?).map_err(|e| e.to_string())?;
            Ok(json!({ "count": count }).to_string())
        }
        other => Err(format!("unknown d1 operation '{other}'")),
    }
}

fn queue(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let q = env
        .queues
        .get(&call.name)
        .ok_or_else(|| format!("queue binding '{}' not found", call.name))?;
    match call.op.as_str() {
        "send" => {
            q.send(arg(call, 0), arg_opt_u64(call, 1))
                .map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "sendBatch" => {
            let bodies = match arg(call, 0) {
                Value::Array(items) => items,
                other => return Err(format!("sendBatch expects an array, got {other}")),
            };
            q.send_batch(bodies).map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        other => Err(format!("unknown queue operation '{other}'")),
    }
}

fn bucket(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let bucket = env
        .storage
        .get(&call.name)
        .ok_or_else(|| format!("storage binding '{}' not found", call.name))?;
    match call.op.as_str() {
        "get" => match bucket.get(&arg_str(call, 0)?).map_err(|e| e.to_string())? {
            Some(object) => Ok(json!({
                "found": true,
                "key": object.metadata.key,
                "size": object.metadata.size,
                "contentType": object.metadata.content_type,
                "bodyB64": BASE64.encode(&object.body),
            })
            .to_string()),
            None => Ok(json!({ "found": false }).to_string()),
        },
        "head" => match bucket.head(&arg_str(call, 0)?).map_err(|e| e.to_string())? {
            Some(meta) => Ok(json!({
                "found": true,
                "key": meta.key,
                "size": meta.size,
                "contentType": meta.content_type,
            })
            .to_string()),
            None => Ok(json!({ "found": false }).to_string()),
        },
        "put" => {
            let key = arg_str(call, 0)?;
            let body = BASE64
                .decode(arg_str(call, 1)?)
                .map_err(|e| format!("invalid object body: {e}"))?;
            bucket
                .put(&key, body, arg_opt_str(call, 2))
                .map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "delete" => {
            bucket
                .delete(&arg_str(call, 0)?)
                .map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "list" => {
            let prefix = arg_opt_str(call, 0);
            let limit = arg_opt_u64(call, 1).unwrap_or(1000) as usize;
            let objects = bucket
                .list(prefix.as_deref(), limit)
                .map_err(|e| e.to_string())?;
            Ok(json!({ "objects": objects }).to_string())
        }
        other => Err(format!("unknown storage operation '{other}'")),
    }
}

fn durable_object(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let ns = env
        .durable_objects
        .get(&call.name)
        .ok_or_else(|| format!("durable object binding '{}' not found", call.name))?;
    match call.op.as_str() {
        "fetch" => {
            let id = arg_str(call, 0)?;
            let request = arg_request(call, 1)?;
            let response = ns.fetch(&id, request).map_err(|e| e.to_string())?;
            Ok(wire_response(&response).to_string())
        }
        other => Err(format!("unknown durable object operation '{other}'")),
    }
}

fn service(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let target = env
        .services
        .get(&call.name)
        .ok_or_else(|| format!("service binding '{}' not found", call.name))?;
    let dispatcher = env
        .dispatcher
        .clone()
        .ok_or_else(|| "no dispatcher available for service bindings".to_string())?;
    match call.op.as_str() {
        "fetch" => {
            let request = arg_request(call, 0)?;
            let outcome: DispatchOutcome =
                dispatcher.dispatch(&target.site, &target.deploy, Environment::new(), request);
            if !outcome.logs.is_empty() {
                debug!(
                    service = %call.name,
                    lines = outcome.logs.len(),
                    "sub-request produced logs"
                );
            }
            if let Some(error) = outcome.error {
                return Err(format!("service '{}' failed: {error}", call.name));
            }
            match outcome.response {
                Some(response) => Ok(wire_response(&response).to_string()),
                None => Err(format!("service '{}' returned no response", call.name)),
            }
        }
        other => Err(format!("unknown service operation '{other}'")),
    }
}

fn assets(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let fetcher = env
        .assets
        .clone()
        .ok_or_else(|| "no assets binding configured".to_string())?;
    match call.op.as_str() {
        "fetch" => {
            let request = arg_request(call, 0)?;
            let response = fetcher.fetch(&request).map_err(|e| e.to_string())?;
            Ok(wire_response(&response).to_string())
        }
        other => Err(format!("unknown assets operation '{other}'")),
    }
}

fn cache(env: &Arc<Environment>, call: &BindingCall) -> Result<String, String> {
    let cache = env
        .cache
        .clone()
        .ok_or_else(|| "no cache binding configured".to_string())?;
    match call.op.as_str() {
        "match" => match cache.lookup(&arg_str(call, 0)?).map_err(|e| e.to_string())? {
            Some(response) => {
                Ok(json!({ "found": true, "response": wire_response(&response) }).to_string())
            }
            None => Ok(json!({ "found": false }).to_string()),
        },
        "put" => {
            let url = arg_str(call, 0)?;
            let wire: Value = arg(call, 1);
            let response = response_from_wire(&wire)?;
            cache.put(&url, response).map_err(|e| e.to_string())?;
            Ok("{}".to_string())
        }
        "delete" => {
            let deleted = cache
                .delete(&arg_str(call, 0)?)
                .map_err(|e| e.to_string())?;
            Ok(json!({ "deleted": deleted }).to_string())
        }
        other => Err(format!("unknown cache operation '{other}'")),
    }
}

fn response_from_wire(wire: &Value) -> Result<HostResponse, String> {
    let status = wire["status"].as_u64().unwrap_or(200) as u16;
    let status_text = wire["statusText"].as_str().unwrap_or("").to_string();
    let mut headers = HashMap::new();
    if let Some(map) = wire["headers"].as_object() {
        for (name, value) in map {
            if let Some(v) = value.as_str() {
                headers.insert(name.to_ascii_lowercase(), v.to_string());
            }
        }
    }
    let body = match wire["bodyB64"].as_str() {
        Some(encoded) if !encoded.is_empty() => BASE64
            .decode(encoded)
            .map_err(|e| format!("invalid response body: {e}"))?,
        _ => Vec::new(),
    };
    Ok(HostResponse {
        status,
        status_text,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_bindings::memory::{MemoryKv, MemoryQueue};
    use hornet_bindings::KvStore;

    fn call(kind: &str, name: &str, op: &str, args: Vec<Value>) -> BindingCall {
        BindingCall {
            kind: kind.to_string(),
            name: name.to_string(),
            op: op.to_string(),
            args,
        }
    }

    #[test]
    fn kv_round_trip_through_generic_call() {
        let kv = Arc::new(MemoryKv::new());
        let env = Arc::new(Environment::new().with_kv("STORE", kv.clone()));

        let put = call("kv", "STORE", "put", vec![json!("k"), json!("v")]);
        assert_eq!(run(&env, put).unwrap(), "{}");
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));

        let get = call("kv", "STORE", "get", vec![json!("k")]);
        assert_eq!(run(&env, get).unwrap(), r#"{"value":"v"}"#);

        let miss = call("kv", "STORE", "get", vec![json!("absent")]);
        assert_eq!(run(&env, miss).unwrap(), r#"{"value":null}"#);
    }

    #[test]
    fn unknown_binding_is_an_error() {
        let env = Arc::new(Environment::new());
        let err = run(&env, call("kv", "NOPE", "get", vec![json!("k")])).unwrap_err();
        assert!(err.contains("'NOPE' not found"));
    }

    #[test]
    fn queue_send_lands_in_store() {
        let q = Arc::new(MemoryQueue::new());
        let env = Arc::new(Environment::new().with_queue("JOBS", q.clone()));
        run(&env, call("queue", "JOBS", "send", vec![json!({"n": 1}), Value::Null])).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn wire_request_decodes_base64_body() {
        let wire: WireRequest = serde_json::from_value(json!({
            "url": "http://h/",
            "method": "POST",
            "headers": { "X-One": "1" },
            "bodyB64": BASE64.encode(b"payload"),
        }))
        .unwrap();
        let host = wire.into_host().unwrap();
        assert_eq!(host.body, b"payload");
        assert_eq!(host.header("x-one"), Some("1"));
    }

    #[test]
    fn response_from_wire_defaults() {
        let resp = response_from_wire(&json!({ "status": 204 })).unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }
}
