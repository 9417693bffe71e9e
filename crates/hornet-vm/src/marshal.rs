//! Payload builders and parsers for the values that cross the bridge
//! whole: the request handed to a handler, the environment
//! description, scheduled events, and the converted response coming
//! back.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hornet_bindings::{Environment, HostRequest, HostResponse};
use serde_json::json;

/// Quote a Rust string as a JS string literal.
pub fn js_string(s: &str) -> String {
    crate::host::js_string_literal(s)
}

/// The marshal form `__makeRequest` consumes.
pub fn request_payload(request: &HostRequest) -> String {
    json!({
        "url": request.url,
        "method": request.method,
        "headers": request.headers,
        "bodyB64": BASE64.encode(&request.body),
    })
    .to_string()
}

/// The marshal form `__makeEnv` consumes: values for vars/secrets,
/// names only for every binding kind.
pub fn env_payload(env: &Environment) -> String {
    fn names<'a>(keys: Vec<&'a String>) -> Vec<&'a String> {
        let mut sorted = keys;
        sorted.sort();
        sorted
    }
    json!({
        "vars": env.vars,
        "secrets": env.secrets,
        "kv": names(env.kv.keys().collect()),
        "d1": names(env.d1.keys().collect()),
        "queues": names(env.queues.keys().collect()),
        "storage": names(env.storage.keys().collect()),
        "durableObjects": names(env.durable_objects.keys().collect()),
        "services": names(env.services.keys().collect()),
        "hasAssets": env.assets.is_some(),
        "hasCache": env.cache.is_some(),
        "siteId": env.site_id,
    })
    .to_string()
}

/// The marshal form `__makeScheduledEvent` consumes.
pub fn scheduled_payload(cron: &str, scheduled_time_ms: u64) -> String {
    json!({ "cron": cron, "scheduledTime": scheduled_time_ms }).to_string()
}

/// A handler's Response after `__convertResponse`.
#[derive(Debug, Clone)]
pub struct ConvertedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Pair id of an attached WebSocket peer, when the handler is
    /// upgrading.
    pub websocket_pair: Option<u64>,
}

impl ConvertedResponse {
    pub fn into_host(self) -> HostResponse {
        HostResponse {
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Parse the JSON `__convertResponse` produced. `Err` carries the
/// conversion failure description (handler returned a non-Response).
pub fn parse_converted_response(raw: &str) -> Result<ConvertedResponse, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("malformed conversion result: {e}"))?;
    if value["ok"] != json!(true) {
        return Err(value["error"]
            .as_str()
            .unwrap_or("handler returned a non-Response value")
            .to_string());
    }
    let mut headers = HashMap::new();
    if let Some(map) = value["headers"].as_object() {
        for (name, v) in map {
            if let Some(s) = v.as_str() {
                headers.insert(name.to_ascii_lowercase(), s.to_string());
            }
        }
    }
    let body = match value["bodyB64"].as_str() {
        Some(encoded) if !encoded.is_empty() => BASE64
            .decode(encoded)
            .map_err(|e| format!("malformed response body: {e}"))?,
        _ => Vec::new(),
    };
    Ok(ConvertedResponse {
        status: value["status"].as_u64().unwrap_or(200) as u16,
        status_text: value["statusText"].as_str().unwrap_or("").to_string(),
        headers,
        body,
        websocket_pair: value["webSocket"].as_u64(),
    })
}
