//! Scripted LLM for tests: plays a queue of turns, each a list of stream
//! events plus a final response, with a configurable inter-event delay so
//! cancellation paths can be exercised.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{LlmClient, LlmError, LlmResponse, PermissionDecision, SdkEvent};
use crate::message::Message;

/// One scripted stream event. `Permission` emits a permission request and
/// blocks the turn until the arbiter resolves it.
#[derive(Clone, Debug)]
pub enum ScriptEvent {
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
    },
}

/// One scripted call: events to stream, then the final outcome.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTurn {
    pub events: Vec<ScriptEvent>,
    /// `Err` makes the call fail with [`LlmError::Api`].
    pub error: Option<String>,
    pub response: String,
    /// Returned by `invoke_structured` instead of parsing `response`.
    pub structured: Option<Value>,
}

impl ScriptedTurn {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            structured: Some(value),
            ..Default::default()
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

type Responder = dyn Fn(&[Message]) -> Option<ScriptedTurn> + Send + Sync;

/// Scripted LLM client. A responder (if set) is consulted first, keyed on the
/// call's messages; otherwise turns are consumed in order; when the queue is
/// empty every call returns `default_response`.
pub struct MockLlm {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    responder: Option<Box<Responder>>,
    default_response: String,
    event_delay: Duration,
    calls: Mutex<Vec<Vec<Message>>>,
    decisions: Mutex<Vec<PermissionDecision>>,
}

impl MockLlm {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            responder: None,
            default_response: default_response.into(),
            event_delay: Duration::from_millis(0),
            calls: Mutex::new(Vec::new()),
            decisions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.turns.lock().unwrap().push_back(turn);
        self
    }

    /// Content-keyed scripting for concurrent callers: the function sees the
    /// call's messages and may return the turn to play.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Message]) -> Option<ScriptedTurn> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Delay before each streamed event; gives tests a window to cancel.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Messages from every call, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// Permission decisions the arbiter returned to scripted requests.
    pub fn decisions(&self) -> Vec<PermissionDecision> {
        self.decisions.lock().unwrap().clone()
    }

    fn next_turn(&self, messages: &[Message]) -> ScriptedTurn {
        self.calls.lock().unwrap().push(messages.to_vec());
        if let Some(turn) = self.responder.as_ref().and_then(|f| f(messages)) {
            return turn;
        }
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::text(self.default_response.clone()))
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let turn = self.next_turn(messages);
        tokio::time::sleep(self.event_delay).await;
        if let Some(e) = turn.error {
            return Err(LlmError::Api(e));
        }
        Ok(LlmResponse {
            content: turn.response,
            usage: None,
        })
    }

    async fn invoke_structured(
        &self,
        messages: &[Message],
        _schema: &Value,
    ) -> Result<Value, LlmError> {
        let turn = self.next_turn(messages);
        tokio::time::sleep(self.event_delay).await;
        if let Some(e) = turn.error {
            return Err(LlmError::Api(e));
        }
        match turn.structured {
            Some(v) => Ok(v),
            None => super::extract_json_object(&turn.response),
        }
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        events: mpsc::Sender<SdkEvent>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let turn = self.next_turn(messages);
        for ev in turn.events {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(self.event_delay) => {}
            }
            let sdk_event = match ev {
                ScriptEvent::Text(t) => SdkEvent::Text(t),
                ScriptEvent::Thinking(t) => SdkEvent::Thinking(t),
                ScriptEvent::ToolUse { id, name, input } => SdkEvent::ToolUse { id, name, input },
                ScriptEvent::ToolResult {
                    tool_use_id,
                    name,
                    output,
                    is_error,
                } => SdkEvent::ToolResult {
                    tool_use_id,
                    name,
                    output,
                    is_error,
                },
                ScriptEvent::Permission {
                    tool_name,
                    tool_input,
                } => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if events
                        .send(SdkEvent::Permission {
                            tool_name,
                            tool_input,
                            reply: reply_tx,
                        })
                        .await
                        .is_err()
                    {
                        return Err(LlmError::Cancelled);
                    }
                    let decision = tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        d = reply_rx => d.map_err(|_| LlmError::Api("permission reply dropped".into()))?,
                    };
                    let interrupted = !decision.allowed && decision.interrupt;
                    self.decisions.lock().unwrap().push(decision);
                    if interrupted {
                        return Err(LlmError::Cancelled);
                    }
                    continue;
                }
            };
            if events.send(sdk_event).await.is_err() {
                return Err(LlmError::Cancelled);
            }
        }
        if let Some(e) = turn.error {
            return Err(LlmError::Api(e));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            _ = tokio::time::sleep(self.event_delay) => Ok(LlmResponse {
                content: turn.response,
                usage: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turns_play_in_order_then_default() {
        let llm = MockLlm::new("fallback")
            .with_turn(ScriptedTurn::text("one"))
            .with_turn(ScriptedTurn::text("two"));
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "one");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "two");
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "fallback");
        assert_eq!(llm.calls().len(), 3);
    }

    #[tokio::test]
    async fn stream_cancel_between_events() {
        let llm = MockLlm::new("")
            .with_turn(ScriptedTurn {
                events: vec![
                    ScriptEvent::Text("a".into()),
                    ScriptEvent::Text("b".into()),
                ],
                response: "ab".into(),
                ..Default::default()
            })
            .with_event_delay(Duration::from_millis(20));

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });
        let err = llm
            .invoke_stream(&[], tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        // First event got out before the cancel landed.
        assert!(matches!(rx.recv().await, Some(SdkEvent::Text(t)) if t == "a"));
    }

    #[tokio::test]
    async fn scripted_permission_waits_for_decision() {
        let llm = MockLlm::new("").with_turn(ScriptedTurn {
            events: vec![ScriptEvent::Permission {
                tool_name: "Bash".into(),
                tool_input: serde_json::json!({"command": "ls"}),
            }],
            response: "done".into(),
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel(8);
        let run = tokio::spawn(async move {
            llm.invoke_stream(&[], tx, CancellationToken::new()).await
        });
        match rx.recv().await {
            Some(SdkEvent::Permission { reply, .. }) => {
                reply.send(PermissionDecision::allow()).unwrap();
            }
            other => panic!("expected permission, got {:?}", other),
        }
        let resp = run.await.unwrap().unwrap();
        assert_eq!(resp.content, "done");
    }
}
