//! The terminal shape of one execution.

use std::fmt;
use std::time::Duration;

use hornet_bindings::{HostResponse, LogEntry};

use crate::error::EngineError;
use crate::websocket::WebSocketSession;

/// What one execution produced. Exactly one terminal shape is
/// populated: a response, a WebSocket session, function data, or an
/// error. Captured logs and the duration are always present.
#[derive(Default)]
pub struct ExecutionResult {
    pub response: Option<HostResponse>,
    pub websocket: Option<WebSocketSession>,
    pub logs: Vec<LogEntry>,
    pub data: Option<serde_json::Value>,
    pub duration: Duration,
    pub error: Option<EngineError>,
}

impl ExecutionResult {
    pub fn from_error(error: EngineError, duration: Duration) -> Self {
        Self {
            error: Some(error),
            duration,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The error message, when there is one.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("response", &self.response.as_ref().map(|r| r.status))
            .field("websocket", &self.websocket.is_some())
            .field("logs", &self.logs.len())
            .field("data", &self.data)
            .field("duration", &self.duration)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_result_has_no_terminal_value() {
        let result = ExecutionResult::from_error(EngineError::Timeout(5), Duration::from_millis(5));
        assert!(!result.is_ok());
        assert!(result.response.is_none());
        assert!(result.data.is_none());
        assert!(result.error_message().unwrap().contains("timed out"));
    }
}
