//! Typed handlers for each queue task type.
//!
//! Handlers are idempotent up to user-visible side effects: retrying an
//! embedding overwrites the same blob; retrying a summarization may write a
//! second summary row, which the data model accepts. Every blocking LLM or
//! embedding call races the per-task cancellation token, so daemon shutdown
//! interrupts in-flight work instead of waiting out its deadline.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextBuilder, ContextError, ContextMode, ContextRequest};
use crate::error::{ErrorKind, Kinded};
use crate::explore::{ExploreError, Explorer};
use crate::llm::{Embedder, LlmClient, LlmError};
use crate::message::Message;
use crate::queue::{QueueTask, TaskType};
use crate::store::summary::NewSummary;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("bad task metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Explore(#[from] ExploreError),
}

impl Kinded for WorkerError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Metadata(_) => ErrorKind::InvalidRequest,
            WorkerError::Store(e) => e.kind(),
            WorkerError::Llm(e) => e.kind(),
            WorkerError::Context(e) => e.kind(),
            WorkerError::Explore(e) => e.kind(),
        }
    }
}

/// Everything a handler may need.
pub struct WorkerServices {
    pub store: Store,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LlmClient>,
    pub context: Arc<ContextBuilder>,
    pub explorer: Arc<Explorer>,
    /// Model recorded on summaries written by background work.
    pub utility_model: String,
}

/// Dispatches one claimed task to its handler.
pub async fn handle(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    match task.task_type {
        TaskType::Embedding => embed(services, task, &cancel).await,
        TaskType::Summarization => summarize(services, task, &cancel).await,
        TaskType::EntityExtraction => extract_entities(services, task, &cancel).await,
        TaskType::ContextBuilding => build_context(services, task, &cancel).await,
        TaskType::Exploration => explore(services, task, &cancel).await,
    }
}

fn meta_str<'a>(task: &'a QueueTask, key: &str) -> Option<&'a str> {
    task.metadata.get(key).and_then(|v| v.as_str())
}

fn meta_i64(task: &QueueTask, key: &str) -> Option<i64> {
    task.metadata.get(key).and_then(|v| v.as_i64())
}

async fn embed(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let conversation_id = meta_i64(task, "conversation_id")
        .ok_or_else(|| WorkerError::Metadata("embedding task missing conversation_id".into()))?;
    let content_refs = [task.content.as_str()];
    let vectors = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Llm(LlmError::Cancelled)),
        r = services.embedder.embed(&content_refs) => r?,
    };
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| WorkerError::Llm(LlmError::Api("embedder returned no vector".into())))?;
    match services
        .store
        .update_conversation_embedding(conversation_id, vector)
        .await
    {
        // The conversation may have been retained away; nothing to retry.
        Err(StoreError::NotFound(_)) => {
            tracing::warn!(conversation_id, "embedding target vanished");
            Ok(())
        }
        other => Ok(other?),
    }
}

async fn summarize(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let session_id = task
        .session_id
        .clone()
        .or_else(|| meta_str(task, "session_id").map(String::from))
        .ok_or_else(|| WorkerError::Metadata("summarization task missing session_id".into()))?;
    let mode = meta_str(task, "mode").unwrap_or("exit").to_string();
    let max_length = meta_i64(task, "max_length").unwrap_or(600);
    let personality = meta_str(task, "personality").unwrap_or("default").to_string();

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "key_topics": { "type": "array", "items": { "type": "string" } },
            "task_status": { "type": "string" },
            "next_steps": { "type": "string" }
        },
        "required": ["summary", "key_topics"]
    });
    let messages = [
        Message::system(format!(
            "Summarize the session transcript below in at most {} characters, in the voice \
             of the '{}' personality. Note open work in next_steps.",
            max_length, personality
        )),
        Message::user(task.content.clone()),
    ];
    let value = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Llm(LlmError::Cancelled)),
        r = services.llm.invoke_structured(&messages, &schema) => r?,
    };

    services
        .store
        .insert_summary(NewSummary {
            session_id,
            summary_type: mode,
            summary: value["summary"].as_str().unwrap_or_default().to_string(),
            key_topics: value["key_topics"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            key_entities: Vec::new(),
            task_status: value["task_status"].as_str().map(String::from),
            next_steps: value["next_steps"].as_str().map(String::from),
            model: services.utility_model.clone(),
        })
        .await?;
    Ok(())
}

async fn extract_entities(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let context_hint = meta_str(task, "context_hint").unwrap_or("");
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "kind": { "type": "string" }
                    },
                    "required": ["name"]
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from": { "type": "string" },
                        "to": { "type": "string" },
                        "relation": { "type": "string" }
                    },
                    "required": ["from", "to", "relation"]
                }
            }
        },
        "required": ["entities"]
    });
    let messages = [
        Message::system(format!(
            "Extract named entities and their relationships from the text. {}",
            context_hint
        )),
        Message::user(task.content.clone()),
    ];
    let value = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Llm(LlmError::Cancelled)),
        r = services.llm.invoke_structured(&messages, &schema) => r?,
    };

    let session_id = task.session_id.clone();
    let mut ids = std::collections::HashMap::new();
    if let Some(entities) = value["entities"].as_array() {
        for e in entities {
            let Some(name) = e["name"].as_str().filter(|n| !n.is_empty()) else {
                continue;
            };
            let kind = e["kind"].as_str().unwrap_or("concept");
            let id = services
                .store
                .upsert_entity(name, kind, session_id.clone())
                .await?;
            ids.insert(name.to_string(), id);
        }
    }
    if let Some(relations) = value["relationships"].as_array() {
        for r in relations {
            let (Some(from), Some(to), Some(rel)) = (
                r["from"].as_str().and_then(|n| ids.get(n)),
                r["to"].as_str().and_then(|n| ids.get(n)),
                r["relation"].as_str(),
            ) else {
                continue;
            };
            services.store.add_entity_relation(*from, *to, rel).await?;
        }
    }
    Ok(())
}

async fn build_context(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let session_id = meta_str(task, "session_id")
        .map(String::from)
        .or_else(|| task.session_id.clone())
        .ok_or_else(|| WorkerError::Metadata("context task missing session_id".into()))?;
    let request = ContextRequest {
        session_id,
        project_path: meta_str(task, "project_path").unwrap_or("").to_string(),
        personality: meta_str(task, "personality").unwrap_or("default").to_string(),
        depth: meta_i64(task, "depth").unwrap_or(10).max(1) as usize,
        include_entities: task
            .metadata
            .get("include_entities")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        max_tokens: meta_i64(task, "max_tokens").unwrap_or(2000).max(100) as usize,
        current_prompt: task.content.clone(),
        mode: ContextMode::parse(meta_str(task, "mode").unwrap_or("smart")),
    };
    tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Llm(LlmError::Cancelled)),
        r = services.context.build(&request) => r?,
    };
    Ok(())
}

async fn explore(
    services: &WorkerServices,
    task: &QueueTask,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let task_id = meta_str(task, "task_id")
        .map(String::from)
        .unwrap_or_else(|| task.content.clone());
    if task_id.is_empty() {
        return Err(WorkerError::Metadata("exploration task missing task_id".into()));
    }
    services.explorer.run_task(&task_id, cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::{NullFactIntegration, NullKnowledgeGraph};
    use crate::llm::{MockEmbedder, MockLlm, ScriptedTurn};
    use crate::store::session::NewSession;

    const DIM: usize = 8;

    async fn setup(llm: MockLlm) -> (tempfile::TempDir, Store, WorkerServices) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), DIM).unwrap();
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let llm = Arc::new(llm);
        let services = WorkerServices {
            store: store.clone(),
            embedder: embedder.clone(),
            llm: llm.clone(),
            context: Arc::new(ContextBuilder::new(store.clone(), embedder)),
            explorer: Arc::new(Explorer::new(
                store.clone(),
                llm,
                Arc::new(NullFactIntegration),
                Arc::new(NullKnowledgeGraph),
            )),
            utility_model: "test-model".into(),
        };
        (dir, store, services)
    }

    fn queue_task(task_type: TaskType, content: &str, metadata: serde_json::Value) -> QueueTask {
        QueueTask {
            id: 1,
            task_type,
            model_name: "m".into(),
            content: content.into(),
            metadata,
            priority: 0,
            session_id: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn summarization_writes_summary_row() {
        let llm = MockLlm::new("").with_turn(ScriptedTurn::structured(serde_json::json!({
            "summary": "worked on the parser",
            "key_topics": ["parser"],
            "next_steps": "add tests"
        })));
        let (_d, store, services) = setup(llm).await;
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut task = queue_task(
            TaskType::Summarization,
            "user: fix parser\nassistant: done",
            serde_json::json!({"mode": "exit", "max_length": 400, "personality": "tsun"}),
        );
        task.session_id = Some(sid.clone());
        handle(&services, &task, CancellationToken::new())
            .await
            .unwrap();

        let summaries = store.recent_summaries(5, None, None).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary, "worked on the parser");
        assert_eq!(summaries[0].summary_type, "exit");
        assert_eq!(summaries[0].key_topics, vec!["parser".to_string()]);
        assert_eq!(summaries[0].next_steps.as_deref(), Some("add tests"));
    }

    #[tokio::test]
    async fn entity_extraction_upserts_and_relates() {
        let llm = MockLlm::new("").with_turn(ScriptedTurn::structured(serde_json::json!({
            "entities": [
                {"name": "hearth", "kind": "project"},
                {"name": "sqlite", "kind": "library"}
            ],
            "relationships": [
                {"from": "hearth", "to": "sqlite", "relation": "uses"}
            ]
        })));
        let (_d, store, services) = setup(llm).await;
        let task = queue_task(
            TaskType::EntityExtraction,
            "hearth stores data in sqlite",
            serde_json::json!({"content_type": "conversation"}),
        );
        handle(&services, &task, CancellationToken::new())
            .await
            .unwrap();
        assert!(store.entity_by_name("hearth").await.unwrap().is_some());
        assert!(store.entity_by_name("sqlite").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn context_building_fills_cache() {
        let (_d, store, services) = setup(MockLlm::new("")).await;
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_conversation(crate::store::conversation::NewConversation {
                session_id: sid.clone(),
                prompt: "hello".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();

        let task = queue_task(
            TaskType::ContextBuilding,
            "",
            serde_json::json!({
                "session_id": sid,
                "project_path": "/p",
                "personality": "tsun",
                "depth": 5,
                "include_entities": false,
                "max_tokens": 2000,
                "mode": "smart"
            }),
        );
        handle(&services, &task, CancellationToken::new())
            .await
            .unwrap();
        let cached = store.read_context_cache(&sid, 1).await.unwrap().unwrap();
        assert!(cached.context.contains("hello"));
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_llm_bound_handler() {
        let llm = MockLlm::new("").with_event_delay(std::time::Duration::from_millis(100));
        let (_d, store, services) = setup(llm).await;
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut task = queue_task(
            TaskType::Summarization,
            "user: long transcript",
            serde_json::json!({"mode": "exit"}),
        );
        task.session_id = Some(sid);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handle(&services, &task, cancel).await.unwrap_err();
        assert!(matches!(err, WorkerError::Llm(LlmError::Cancelled)));
        // Nothing was written.
        assert!(store.recent_summaries(5, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_is_a_metadata_error() {
        let (_d, _store, services) = setup(MockLlm::new("")).await;
        let task = queue_task(TaskType::Embedding, "text", serde_json::json!({}));
        let err = handle(&services, &task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Metadata(_)));
    }
}
