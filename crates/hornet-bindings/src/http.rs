//! Host-side HTTP shapes.
//!
//! Headers are a flat map of lowercased names to comma-joined values,
//! bodies are byte buffers, URLs are absolute. This is the form the
//! engine's front end hands in and gets back; the JS-facing `Request`
//! and `Response` objects are built from it by the bridge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl HostRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Insert a header, comma-joining on repeats.
    pub fn insert_header(&mut self, name: &str, value: String) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Default for HostResponse {
    fn default() -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

impl HostResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = status;
        self.status_text = status_text.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_lowercase_and_join() {
        let mut req = HostRequest::get("http://h/");
        req.insert_header("Accept", "text/html".to_string());
        req.insert_header("ACCEPT", "application/json".to_string());
        assert_eq!(req.header("accept"), Some("text/html, application/json"));
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn response_defaults() {
        let resp = HostResponse::ok("hi");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_text(), "hi");
    }

    #[test]
    fn marshal_is_camel_case() {
        let resp = HostResponse::ok("x").with_status(404, "Not Found");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""statusText":"Not Found""#));
    }
}
