//! Gateway event types: wire shape is `{"type": ..., "data": {...}}`.
//! The envelope (timestamp, seq) is applied separately.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Latency counters for one completed query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTimings {
    /// Milliseconds until the first streamed token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<i64>,
    /// Milliseconds for the full response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<i64>,
    /// Milliseconds spent in thinking blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_ms: Option<i64>,
}

/// One gateway event: type tag plus `data` payload.
///
/// Serializes as `{"type": "<variant>", "data": {...}}`; unit-payload variants
/// carry an empty object so clients can always read `data`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    SessionReady {
        session_id: String,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Cancelled {
        message: String,
    },
    Done {
        response_text: String,
        tool_count: u32,
        timings: QueryTimings,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_output: Option<Value>,
    },
    Pong {},
}

impl GatewayEvent {
    /// Serializes this event to a JSON object (type + data only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Whether replay skips this event for resuming clients: the client already
    /// holds its own session-ready state.
    pub fn is_session_ready(&self) -> bool {
        matches!(self, GatewayEvent::SessionReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_event_wire_shape() {
        let ev = GatewayEvent::Text {
            text: "hi".to_string(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["data"]["text"], "hi");
    }

    #[test]
    fn done_event_omits_empty_structured_output() {
        let ev = GatewayEvent::Done {
            response_text: "ok".to_string(),
            tool_count: 2,
            timings: QueryTimings {
                ttft_ms: Some(12),
                response_ms: Some(340),
                thinking_ms: None,
            },
            structured_output: None,
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "done");
        assert_eq!(v["data"]["tool_count"], 2);
        assert_eq!(v["data"]["timings"]["ttft_ms"], 12);
        assert!(v["data"].get("structured_output").is_none());
        assert!(v["data"]["timings"].get("thinking_ms").is_none());
    }

    #[test]
    fn permission_request_roundtrip() {
        let ev = GatewayEvent::PermissionRequest {
            request_id: "req-1".to_string(),
            tool_name: "Bash".to_string(),
            tool_input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"permission_request\""));
        let parsed: GatewayEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            GatewayEvent::PermissionRequest { request_id, .. } => {
                assert_eq!(request_id, "req-1")
            }
            _ => panic!("expected permission_request"),
        }
    }
}
