//! WebSocket message types for the streaming agent gateway (client → server).
//! Server → client events live in the `stream-event` crate.

use serde::{Deserialize, Serialize};

/// Per-session configuration supplied by the client on `new_session` and
/// `update_config`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,
}

/// Client-to-server message envelope.
///
/// Each variant maps to a JSON object with `"type": "<variant_name>"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    NewSession {
        config: SessionConfig,
    },
    ResumeSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<u64>,
    },
    UpdateConfig {
        config: SessionConfig,
    },
    Query {
        prompt: String,
    },
    Cancel,
    PermissionResponse {
        request_id: String,
        allowed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deny_message: Option<String>,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_roundtrip() {
        let msg = ClientMessage::NewSession {
            config: SessionConfig {
                working_dir: "/p".into(),
                personality: Some("tsun".into()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"new_session\""));
        assert!(json.contains("\"working_dir\":\"/p\""));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientMessage::NewSession { .. }));
    }

    #[test]
    fn unit_variants_parse_from_bare_type() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Cancel));
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping));
    }

    #[test]
    fn resume_without_last_seq_parses() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"resume_session","session_id":"s1"}"#).unwrap();
        match parsed {
            ClientMessage::ResumeSession {
                session_id,
                last_seq,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(last_seq, None);
            }
            _ => panic!("expected resume_session"),
        }
    }

    #[test]
    fn permission_response_roundtrip() {
        let json = r#"{"type":"permission_response","request_id":"r1","allowed":false,"deny_message":"no"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::PermissionResponse {
                request_id,
                allowed,
                deny_message,
            } => {
                assert_eq!(request_id, "r1");
                assert!(!allowed);
                assert_eq!(deny_message.as_deref(), Some("no"));
            }
            _ => panic!("expected permission_response"),
        }
    }
}
