//! One gateway query: context assembly, LLM streaming, permission
//! arbitration, persistence, and fire-and-forget side effects.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use stream_event::{GatewayEvent, QueryTimings};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Emitter, Gateway};
use crate::context::{ContextMode, ContextRequest};
use crate::llm::{LlmClient, LlmError, PermissionDecision, SdkEvent};
use crate::message::Message;
use crate::queue::TaskType;
use crate::store::conversation::{Block, Latency, NewConversation};

/// What the event forwarder learned about the stream, for persistence.
#[derive(Default)]
struct QueryTrace {
    text: String,
    blocks: Vec<Block>,
    tool_names: Vec<String>,
    tool_count: u32,
    first_token_ms: Option<i64>,
}

pub(super) async fn run_query(
    gateway: Arc<Gateway>,
    emitter: Emitter,
    pending: Arc<DashMap<String, oneshot::Sender<PermissionDecision>>>,
    prompt: String,
    cancel: CancellationToken,
) {
    let (session_id, config) = {
        let channel = emitter.channel.lock().await;
        (channel.session_id.clone(), channel.config.clone())
    };

    // Persist the user message; its embedding arrives via the queue.
    let prompt = inject_shareable_finding(&gateway, prompt).await;
    match gateway
        .store
        .store_conversation(NewConversation {
            session_id: session_id.clone(),
            prompt: prompt.clone(),
            message_type: "user",
            personality: config.personality.clone().unwrap_or_default(),
            medium: config.medium.clone().unwrap_or_else(|| "agent".into()),
            user_id: config.user_id.clone(),
            ..Default::default()
        })
        .await
    {
        Ok(conversation_id) => {
            let _ = gateway
                .store
                .queue_add(
                    TaskType::Embedding,
                    &gateway.config.embed_model,
                    &prompt,
                    serde_json::json!({ "conversation_id": conversation_id }),
                    0,
                    Some(session_id.clone()),
                )
                .await;
        }
        Err(e) => {
            emitter
                .emit(GatewayEvent::Error {
                    message: format!("cannot persist message: {}", e),
                    recoverable: true,
                })
                .await;
            return;
        }
    }

    let context_doc = load_or_build_context(&gateway, &session_id, &config, &prompt).await;
    let mut system = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| "You are a coding assistant with durable memory.".to_string());
    if let Some(doc) = context_doc {
        system.push_str("\n\nContext from prior sessions:\n");
        system.push_str(&doc);
    }
    let messages = vec![Message::system(system), Message::user(prompt.clone())];

    // Forwarder: classifies SDK events, arbitrates permissions, stamps and
    // sends everything in order.
    let (sdk_tx, mut sdk_rx) = mpsc::channel::<SdkEvent>(64);
    let forwarder = {
        let emitter = emitter.clone();
        let cancel = cancel.clone();
        let pending = pending.clone();
        let timeout = gateway.config.permission_timeout;
        let started = Instant::now();
        tokio::spawn(async move {
            let mut trace = QueryTrace::default();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = sdk_rx.recv() => match ev { Some(e) => e, None => break },
                };
                forward_event(&emitter, &pending, timeout, started, &mut trace, event).await;
            }
            trace
        })
    };

    let llm = gateway.llm.clone();
    let invoke = llm.invoke_stream(&messages, sdk_tx, cancel.clone());
    let started = Instant::now();

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        r = invoke => r,
    };
    // The invoke future (and its sender) is gone either way; the forwarder
    // drains and exits before anything else is emitted.
    let trace = forwarder.await.unwrap_or_default();

    match result {
        Err(LlmError::Cancelled) => {
            emitter
                .emit(GatewayEvent::Cancelled {
                    message: "query cancelled".into(),
                })
                .await;
        }
        Err(e) => {
            emitter
                .emit(GatewayEvent::Error {
                    message: e.to_string(),
                    recoverable: true,
                })
                .await;
        }
        Ok(response) => {
            let response_ms = started.elapsed().as_millis() as i64;
            let text = if response.content.is_empty() {
                trace.text.clone()
            } else {
                response.content.clone()
            };
            let timings = QueryTimings {
                ttft_ms: trace.first_token_ms,
                response_ms: Some(response_ms),
                thinking_ms: None,
            };
            persist_assistant_turn(&gateway, &session_id, &config, &text, &trace, &timings).await;
            emitter
                .emit(GatewayEvent::Done {
                    response_text: text.clone(),
                    tool_count: trace.tool_count,
                    timings,
                    structured_output: None,
                })
                .await;
            side_effects(&gateway, &session_id, &prompt, &text).await;
        }
    }
}

async fn forward_event(
    emitter: &Emitter,
    pending: &Arc<DashMap<String, oneshot::Sender<PermissionDecision>>>,
    permission_timeout: std::time::Duration,
    started: Instant,
    trace: &mut QueryTrace,
    event: SdkEvent,
) {
    match event {
        SdkEvent::Text(text) => {
            trace
                .first_token_ms
                .get_or_insert_with(|| started.elapsed().as_millis() as i64);
            trace.text.push_str(&text);
            emitter.emit(GatewayEvent::Text { text }).await;
        }
        SdkEvent::Thinking(text) => {
            trace.blocks.push(Block::Thinking(text.clone()));
            emitter.emit(GatewayEvent::Thinking { text }).await;
        }
        SdkEvent::ToolUse { id, name, input } => {
            trace.tool_count += 1;
            trace.tool_names.push(name.clone());
            trace.blocks.push(Block::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
            emitter.emit(GatewayEvent::ToolUse { id, name, input }).await;
        }
        SdkEvent::ToolResult {
            tool_use_id,
            name,
            output,
            is_error,
        } => {
            trace.blocks.push(Block::ToolResult {
                tool_use_id: tool_use_id.clone(),
                output: output.clone(),
                is_error,
            });
            emitter
                .emit(GatewayEvent::ToolResult {
                    tool_use_id,
                    name,
                    output,
                    is_error,
                })
                .await;
        }
        SdkEvent::Permission {
            tool_name,
            tool_input,
            reply,
        } => {
            let request_id = uuid::Uuid::new_v4().to_string();
            pending.insert(request_id.clone(), reply);
            // Unresolved requests deny-with-interrupt after the deadline.
            let pending = pending.clone();
            let timeout_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(permission_timeout).await;
                if let Some((_, reply)) = pending.remove(&timeout_id) {
                    let _ = reply.send(PermissionDecision::deny(
                        Some("permission request timed out".into()),
                        true,
                    ));
                }
            });
            emitter
                .emit(GatewayEvent::PermissionRequest {
                    request_id,
                    tool_name,
                    tool_input,
                })
                .await;
        }
    }
}

async fn load_or_build_context(
    gateway: &Gateway,
    session_id: &str,
    config: &crate::protocol::SessionConfig,
    prompt: &str,
) -> Option<String> {
    match gateway
        .store
        .read_context_cache(session_id, gateway.config.context_max_age_minutes)
        .await
    {
        Ok(Some(entry)) => return Some(entry.context),
        Ok(None) => {}
        Err(e) => tracing::warn!("context cache read failed: {}", e),
    }
    let request = ContextRequest {
        session_id: session_id.to_string(),
        project_path: config.working_dir.clone(),
        personality: config.personality.clone().unwrap_or_default(),
        depth: config
            .context_depth
            .unwrap_or(gateway.config.default_context_depth),
        include_entities: true,
        max_tokens: config
            .max_context_tokens
            .unwrap_or(gateway.config.default_max_context_tokens),
        current_prompt: prompt.to_string(),
        mode: ContextMode::Smart,
    };
    match gateway.context.build(&request).await {
        Ok(built) => Some(built.document),
        // A missing context never blocks a reply.
        Err(e) => {
            tracing::warn!("context build failed: {}", e);
            None
        }
    }
}

/// Prepends one unshared worth-sharing exploration finding, when available.
async fn inject_shareable_finding(gateway: &Gateway, prompt: String) -> String {
    match gateway.store.take_shareable_finding().await {
        Ok(Some(finding)) => {
            let note = finding
                .share_message
                .unwrap_or_else(|| finding.finding.clone());
            format!(
                "[While you were away I found something possibly worth mentioning: {}]\n\n{}",
                note, prompt
            )
        }
        Ok(None) => prompt,
        Err(e) => {
            tracing::warn!("finding injection failed: {}", e);
            prompt
        }
    }
}

async fn persist_assistant_turn(
    gateway: &Gateway,
    session_id: &str,
    config: &crate::protocol::SessionConfig,
    text: &str,
    trace: &QueryTrace,
    timings: &QueryTimings,
) {
    let mut blocks = trace.blocks.clone();
    if !text.is_empty() {
        blocks.push(Block::Text(text.to_string()));
    }
    let stored = gateway
        .store
        .store_conversation(NewConversation {
            session_id: session_id.to_string(),
            prompt: text.to_string(),
            message_type: "assistant",
            personality: config.personality.clone().unwrap_or_default(),
            medium: config.medium.clone().unwrap_or_else(|| "agent".into()),
            user_id: config.user_id.clone(),
            ..Default::default()
        })
        .await;
    let conversation_id = match stored {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("cannot persist assistant turn: {}", e);
            return;
        }
    };
    if let Err(e) = gateway.store.append_blocks(conversation_id, blocks).await {
        tracing::warn!("cannot persist blocks: {}", e);
    }
    if let Err(e) = gateway
        .store
        .update_conversation_latency(
            conversation_id,
            Latency {
                ttft_ms: timings.ttft_ms,
                response_ms: timings.response_ms,
                thinking_ms: timings.thinking_ms,
            },
            trace.tool_count,
            trace.tool_names.clone(),
        )
        .await
    {
        tracing::warn!("cannot persist latency: {}", e);
    }
}

/// Post-completion side effects; failures are logged, never propagated.
async fn side_effects(gateway: &Gateway, session_id: &str, prompt: &str, response: &str) {
    if let Err(e) = track_entity_citations(gateway, session_id, response).await {
        tracing::debug!("citation tracking failed: {}", e);
    }
    gateway.stimulus.curiosity(session_id, response);
    gateway.stimulus.interaction(session_id, prompt, response);
}

/// Records a citation for every context-cache entity whose name appears as a
/// whole word in the response.
async fn track_entity_citations(
    gateway: &Gateway,
    session_id: &str,
    response: &str,
) -> Result<(), crate::store::StoreError> {
    // The freshest cache entry carries the entity names that fed the context.
    let Some(entry) = gateway
        .store
        .read_context_cache(session_id, i64::MAX / 60_000)
        .await?
    else {
        return Ok(());
    };
    for source in entry.sources {
        let Some(name) = source.strip_prefix("entity:") else {
            continue;
        };
        if !contains_whole_word(response, name) {
            continue;
        }
        if let Some(entity) = gateway.store.entity_by_name(name).await? {
            gateway
                .store
                .record_entity_citation(entity.id, session_id)
                .await?;
        }
    }
    Ok(())
}

/// Cache for per-entity word-boundary patterns; entity sets are small and
/// recur across queries.
static WORD_PATTERNS: Lazy<DashMap<String, regex::Regex>> = Lazy::new(DashMap::new);

fn contains_whole_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    if let Some(re) = WORD_PATTERNS.get(word) {
        return re.is_match(haystack);
    }
    let Ok(re) = regex::Regex::new(&format!(r"\b{}\b", regex::escape(word))) else {
        return false;
    };
    let hit = re.is_match(haystack);
    WORD_PATTERNS.insert(word.to_string(), re);
    hit
}

#[cfg(test)]
mod word_tests {
    use super::contains_whole_word;

    #[test]
    fn whole_word_matching() {
        assert!(contains_whole_word("use tokio for async", "tokio"));
        assert!(contains_whole_word("tokio", "tokio"));
        assert!(contains_whole_word("tokio-util is related", "tokio"));
        assert!(!contains_whole_word("mytokio", "tokio"));
        assert!(!contains_whole_word("tokios", "tokio"));
        assert!(!contains_whole_word("anything", ""));
    }
}
