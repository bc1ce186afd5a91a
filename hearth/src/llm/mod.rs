//! LLM client abstraction.
//!
//! The daemon treats the LLM SDK as an external collaborator whose contract
//! is a stream of classified messages plus interruption. [`LlmClient`] is that
//! seam: `invoke` for single-shot background work (summaries, extraction,
//! swarm agents), `invoke_structured` for JSON-schema-forced output
//! (exploration, wellness), and `invoke_stream` for gateway queries, which
//! emits [`SdkEvent`]s and honors a cancellation token.

mod embedder;
mod mock;
mod openai;

pub use embedder::{Embedder, MockEmbedder, OpenAiEmbedder};
pub use mock::{MockLlm, ScriptEvent, ScriptedTurn};
pub use openai::ChatOpenAi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Kinded};
use crate::message::Message;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm output parse error: {0}")]
    Parse(String),
    #[error("llm call cancelled")]
    Cancelled,
}

impl Kinded for LlmError {
    fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Api(_) => ErrorKind::Transient,
            LlmError::Parse(_) => ErrorKind::Internal,
            LlmError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Token usage for one LLM call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Final result of one LLM call.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<LlmUsage>,
}

/// Decision for one tool-permission request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_message: Option<String>,
    /// When true the SDK should interrupt the in-flight turn after denying.
    #[serde(default)]
    pub interrupt: bool,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            deny_message: None,
            interrupt: false,
        }
    }

    pub fn deny(message: Option<String>, interrupt: bool) -> Self {
        Self {
            allowed: false,
            deny_message: message,
            interrupt,
        }
    }
}

/// One classified message from the SDK stream. `Permission` carries the reply
/// channel the arbiter resolves; everything else is forwarded to the client.
pub enum SdkEvent {
    Text(String),
    Thinking(String),
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
    Permission {
        tool_name: String,
        tool_input: Value,
        reply: oneshot::Sender<PermissionDecision>,
    },
}

impl std::fmt::Debug for SdkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdkEvent::Text(t) => f.debug_tuple("Text").field(t).finish(),
            SdkEvent::Thinking(t) => f.debug_tuple("Thinking").field(t).finish(),
            SdkEvent::ToolUse { id, name, .. } => f
                .debug_struct("ToolUse")
                .field("id", id)
                .field("name", name)
                .finish(),
            SdkEvent::ToolResult {
                tool_use_id, name, ..
            } => f
                .debug_struct("ToolResult")
                .field("tool_use_id", tool_use_id)
                .field("name", name)
                .finish(),
            SdkEvent::Permission { tool_name, .. } => f
                .debug_struct("Permission")
                .field("tool_name", tool_name)
                .finish(),
        }
    }
}

/// Extracts the first top-level JSON object from model output, tolerating
/// fence markers and prose around it.
pub fn extract_json_object(content: &str) -> Result<Value, LlmError> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| LlmError::Parse(format!("no JSON object in output: {:.80}", trimmed)))?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + i + 1];
                    return serde_json::from_str(candidate)
                        .map_err(|e| LlmError::Parse(e.to_string()));
                }
            }
            _ => {}
        }
    }
    Err(LlmError::Parse("unterminated JSON object in output".into()))
}

/// LLM client seam. Implementations: [`ChatOpenAi`] (real API), [`MockLlm`]
/// (scripted, for tests).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One non-streaming call: read messages, return the assistant text.
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError>;

    /// JSON-schema-forced call. The default implementation appends the schema
    /// as an instruction and parses the first JSON object from the output.
    async fn invoke_structured(
        &self,
        messages: &[Message],
        schema: &Value,
    ) -> Result<Value, LlmError> {
        let mut augmented = messages.to_vec();
        augmented.push(Message::system(format!(
            "Respond with a single JSON object matching this JSON schema, and nothing else:\n{}",
            schema
        )));
        let response = self.invoke(&augmented).await?;
        extract_json_object(&response.content)
    }

    /// Streaming call for gateway queries: emit [`SdkEvent`]s through
    /// `events` as they arrive and return the final response. Implementations
    /// must observe `cancel` at every suspension point and return
    /// [`LlmError::Cancelled`] promptly after it fires.
    async fn invoke_stream(
        &self,
        messages: &[Message],
        events: mpsc::Sender<SdkEvent>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let response = self.invoke(messages).await?;
        if !response.content.is_empty() {
            let _ = events.send(SdkEvent::Text(response.content.clone())).await;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_clean_output() {
        let v = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extract_json_from_fenced_output() {
        let v = extract_json_object("```json\n{\"a\": {\"b\": \"}\"}}\n```").unwrap();
        assert_eq!(v["a"]["b"], "}");
    }

    #[test]
    fn extract_json_rejects_prose() {
        assert!(extract_json_object("no json here").is_err());
    }

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn invoke(&self, _messages: &[Message]) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: "the answer is {\"n\": 2}".to_string(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn default_invoke_structured_parses_embedded_object() {
        let v = StubLlm
            .invoke_structured(&[Message::user("q")], &serde_json::json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(v["n"], 2);
    }

    #[tokio::test]
    async fn default_invoke_stream_sends_one_text_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let resp = StubLlm
            .invoke_stream(&[Message::user("q")], tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(!resp.content.is_empty());
        match rx.recv().await {
            Some(SdkEvent::Text(t)) => assert_eq!(t, resp.content),
            other => panic!("expected text event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn default_invoke_stream_respects_pre_cancelled_token() {
        let (tx, _rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        token.cancel();
        let err = StubLlm
            .invoke_stream(&[Message::user("q")], tx, token)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }
}
