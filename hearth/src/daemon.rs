//! Daemon façade: wires the storage layer, worker pool, context builder,
//! gateway, orchestrator, exploration, and mode services, and implements the
//! RPC-level operations the serve layer exposes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::DaemonConfig;
use crate::context::ContextBuilder;
use crate::explore::{Explorer, FactIntegration, KnowledgeGraph};
use crate::gateway::{Gateway, GatewayConfig, StimulusSink};
use crate::llm::{Embedder, LlmClient};
use crate::mode::ModeService;
use crate::queue::{QueueStats, TaskType};
use crate::store::conversation::{MessageType, NewConversation};
use crate::store::stats::StorageStats;
use crate::store::{Store, StoreError};
use crate::swarm::orchestrator::{Orchestrator, SwarmConfig};
use crate::worker::{WorkerPool, WorkerServices};

/// Session id as the wrapper sends it: a JSON string or number.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SessionId {
    Text(String),
    Number(i64),
}

impl SessionId {
    pub fn as_string(&self) -> String {
        match self {
            SessionId::Text(s) => s.clone(),
            SessionId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CaptureParams {
    pub session_id: SessionId,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub project_path: String,
    pub prompt: String,
    pub message_type: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub is_command: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContextBuildParams {
    pub session_id: SessionId,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default = "default_depth")]
    pub context_depth: i64,
    #[serde(default)]
    pub include_entities: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default)]
    pub context_mode: String,
    #[serde(default)]
    pub current_prompt: String,
}

fn default_depth() -> i64 {
    10
}

fn default_max_tokens() -> i64 {
    2000
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionEndResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_task: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub storage: StorageStats,
    pub queue: QueueStats,
    pub vector_index: bool,
}

/// Everything the daemon depends on that has an external implementation.
pub struct DaemonDeps {
    pub chat_llm: Arc<dyn LlmClient>,
    pub utility_llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn Embedder>,
    pub facts: Arc<dyn FactIntegration>,
    pub graph: Arc<dyn KnowledgeGraph>,
    pub stimulus: Arc<dyn StimulusSink>,
}

pub struct Daemon {
    pub config: DaemonConfig,
    pub store: Store,
    pub context: Arc<ContextBuilder>,
    pub explorer: Arc<Explorer>,
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<Gateway>,
    pub mode: ModeService,
    services: Arc<WorkerServices>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Daemon {
    /// Opens the store and wires every component. Nothing ticks until
    /// [`Daemon::start_workers`].
    pub fn open(config: DaemonConfig, deps: DaemonDeps) -> Result<Arc<Self>, StoreError> {
        let store = Store::open(config.db_path(), config.embed_dim)?;
        Ok(Self::wire(config, store, deps))
    }

    /// Wires components onto an already-open store (tests use this with a
    /// scratch database).
    pub fn wire(config: DaemonConfig, store: Store, deps: DaemonDeps) -> Arc<Self> {
        let context = Arc::new(ContextBuilder::new(store.clone(), deps.embedder.clone()));
        let explorer = Arc::new(Explorer::new(
            store.clone(),
            deps.utility_llm.clone(),
            deps.facts,
            deps.graph,
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            deps.chat_llm.clone(),
            SwarmConfig {
                default_agent_timeout_secs: config.agent_timeout_secs,
                summary_threshold: config.summary_threshold,
            },
        );
        let gateway = Gateway::new(
            store.clone(),
            deps.chat_llm.clone(),
            context.clone(),
            deps.stimulus,
            GatewayConfig {
                embed_model: config.embed_model.clone(),
                ..Default::default()
            },
        );
        let mode = ModeService::new(store.clone(), deps.utility_llm.clone());
        let services = Arc::new(WorkerServices {
            store: store.clone(),
            embedder: deps.embedder,
            llm: deps.utility_llm,
            context: context.clone(),
            explorer: explorer.clone(),
            utility_model: config.utility_model.clone(),
        });
        Arc::new(Self {
            config,
            store,
            context,
            explorer,
            orchestrator,
            gateway,
            mode,
            services,
            workers: Mutex::new(None),
        })
    }

    /// Starts the background worker pool.
    pub async fn start_workers(&self) {
        let mut guard = self.workers.lock().await;
        if guard.is_none() {
            *guard = Some(WorkerPool::start(
                self.store.clone(),
                self.services.clone(),
                Duration::from_millis(500),
            ));
        }
    }

    /// Stops workers (draining in-flight handlers) and running swarms.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.workers.lock().await.take() {
            pool.shutdown().await;
        }
        self.orchestrator.shutdown().await;
    }

    // --- RPC operations ---------------------------------------------------

    /// `conversation.capture`: persist one exchange and enqueue its
    /// embedding and entity-extraction work.
    pub async fn capture_conversation(&self, params: CaptureParams) -> Result<i64, StoreError> {
        let message_type = MessageType::parse(&params.message_type)?;
        let session_id = params.session_id.as_string();
        self.store
            .ensure_session(&session_id, &params.project_path, &params.personality)
            .await?;
        let conversation_id = self
            .store
            .store_conversation(NewConversation {
                session_id: session_id.clone(),
                prompt: params.prompt.clone(),
                message_type: message_type.as_str(),
                personality: params.personality.clone(),
                medium: params.medium.clone(),
                user_id: None,
            })
            .await?;
        // Commands ("/clear" etc.) are stored for the record but carry no
        // semantic content worth indexing.
        if !params.is_command && !params.prompt.trim().is_empty() {
            self.store
                .queue_add(
                    TaskType::Embedding,
                    &self.config.embed_model,
                    &params.prompt,
                    serde_json::json!({ "conversation_id": conversation_id }),
                    0,
                    Some(session_id.clone()),
                )
                .await?;
            self.store
                .queue_add(
                    TaskType::EntityExtraction,
                    &self.config.utility_model,
                    &params.prompt,
                    serde_json::json!({ "content_type": "conversation" }),
                    0,
                    Some(session_id),
                )
                .await?;
        }
        Ok(conversation_id)
    }

    /// `session.end`: stamp the end time and enqueue one exit summary. The
    /// second call (or an empty session) reports `no_content`.
    pub async fn end_session(
        &self,
        session_id: &str,
        _exit_reason: Option<String>,
    ) -> Result<SessionEndResult, StoreError> {
        self.store.end_session(session_id).await?;
        if self.store.conversation_count(session_id).await? == 0 {
            return Ok(SessionEndResult {
                status: "no_content",
                summary_task: None,
            });
        }
        if self.store.has_summary(session_id, "exit").await?
            || self.has_pending_summary(session_id).await?
        {
            return Ok(SessionEndResult {
                status: "no_content",
                summary_task: None,
            });
        }
        let transcript = self.transcript(session_id, 50).await?;
        let task_id = self
            .store
            .queue_add(
                TaskType::Summarization,
                &self.config.utility_model,
                &transcript,
                serde_json::json!({ "mode": "exit", "max_length": 600 }),
                5,
                Some(session_id.to_string()),
            )
            .await?;
        Ok(SessionEndResult {
            status: "ended",
            summary_task: Some(task_id),
        })
    }

    async fn has_pending_summary(&self, session_id: &str) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                let n: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM task_queue WHERE task_type = 'summarization' \
                         AND session_id = ?1 AND status IN ('pending','processing')",
                        rusqlite::params![session_id],
                        |r| r.get(0),
                    )
                    .map_err(crate::store::map_sql)?;
                Ok(n > 0)
            })
            .await
    }

    async fn transcript(&self, session_id: &str, limit: usize) -> Result<String, StoreError> {
        let mut rows = self.store.recent_conversations(session_id, limit).await?;
        rows.reverse();
        Ok(rows
            .iter()
            .map(|r| format!("{}: {}", r.message_type, r.prompt))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// `context.build`: enqueue and return the task id.
    pub async fn enqueue_context_build(
        &self,
        params: ContextBuildParams,
    ) -> Result<i64, StoreError> {
        let session_id = params.session_id.as_string();
        self.store
            .queue_add(
                TaskType::ContextBuilding,
                &self.config.utility_model,
                &params.current_prompt,
                serde_json::json!({
                    "session_id": session_id,
                    "project_path": params.project_path,
                    "personality": params.personality,
                    "depth": params.context_depth,
                    "include_entities": params.include_entities,
                    "max_tokens": params.max_tokens,
                    "mode": params.context_mode,
                }),
                8,
                Some(session_id.clone()),
            )
            .await
    }

    /// `context.get`: cache read honoring the freshness bound.
    pub async fn get_context(
        &self,
        session_id: &str,
        max_age_minutes: i64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .read_context_cache(session_id, max_age_minutes)
            .await?
            .map(|e| e.context))
    }

    /// `status.get` snapshot.
    pub async fn status(&self) -> Result<StatusSnapshot, StoreError> {
        Ok(StatusSnapshot {
            storage: self.store.storage_stats().await?,
            queue: self.store.queue_stats().await?,
            vector_index: self.store.vec_index_available(),
        })
    }

    /// `queue.add`.
    pub async fn queue_add(
        &self,
        task_type: TaskType,
        model_name: &str,
        content: &str,
        metadata: serde_json::Value,
        priority: i64,
        session_id: Option<String>,
    ) -> Result<i64, StoreError> {
        self.store
            .queue_add(task_type, model_name, content, metadata, priority, session_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::{NullFactIntegration, NullKnowledgeGraph};
    use crate::gateway::NullStimulus;
    use crate::llm::{MockEmbedder, MockLlm};

    const DIM: usize = 8;

    pub(crate) fn test_daemon() -> (tempfile::TempDir, Arc<Daemon>) {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_env(dir.path().to_path_buf());
        let store = Store::open(dir.path().join("hearth.db"), DIM).unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::new("ok"));
        let daemon = Daemon::wire(
            config,
            store,
            DaemonDeps {
                chat_llm: llm.clone(),
                utility_llm: llm,
                embedder: Arc::new(MockEmbedder::new(DIM)),
                facts: Arc::new(NullFactIntegration),
                graph: Arc::new(NullKnowledgeGraph),
                stimulus: Arc::new(NullStimulus),
            },
        );
        (dir, daemon)
    }

    fn capture(session: &str, prompt: &str) -> CaptureParams {
        CaptureParams {
            session_id: SessionId::Text(session.into()),
            personality: "tsun".into(),
            project_path: "/p".into(),
            prompt: prompt.into(),
            message_type: "user".into(),
            medium: "cli".into(),
            exit_code: None,
            is_command: false,
        }
    }

    #[tokio::test]
    async fn capture_creates_session_and_enqueues_work() {
        let (_d, daemon) = test_daemon();
        daemon.capture_conversation(capture("42", "hello")).await.unwrap();

        assert!(daemon.store.session("42").await.unwrap().is_some());
        let stats = daemon.store.queue_stats().await.unwrap();
        // One embedding plus one entity-extraction task.
        assert_eq!(stats.by_status.get("pending"), Some(&2));
    }

    #[tokio::test]
    async fn capture_of_command_skips_indexing() {
        let (_d, daemon) = test_daemon();
        let mut params = capture("42", "/clear");
        params.is_command = true;
        daemon.capture_conversation(params).await.unwrap();
        let stats = daemon.store.queue_stats().await.unwrap();
        assert!(stats.by_status.get("pending").is_none());
    }

    #[tokio::test]
    async fn capture_rejects_unknown_message_type() {
        let (_d, daemon) = test_daemon();
        let mut params = capture("42", "x");
        params.message_type = "narrator".into();
        assert!(daemon.capture_conversation(params).await.is_err());
    }

    #[tokio::test]
    async fn session_end_is_idempotent_for_summaries() {
        let (_d, daemon) = test_daemon();
        daemon.capture_conversation(capture("42", "hello")).await.unwrap();

        let first = daemon.end_session("42", None).await.unwrap();
        assert_eq!(first.status, "ended");
        assert!(first.summary_task.is_some());

        let second = daemon.end_session("42", None).await.unwrap();
        assert_eq!(second.status, "no_content");
        assert!(second.summary_task.is_none());
    }

    #[tokio::test]
    async fn empty_session_end_reports_no_content() {
        let (_d, daemon) = test_daemon();
        daemon
            .store
            .ensure_session("7", "/p", "tsun")
            .await
            .unwrap();
        let result = daemon.end_session("7", None).await.unwrap();
        assert_eq!(result.status, "no_content");
    }

    #[tokio::test]
    async fn context_build_then_get_roundtrip() {
        let (_d, daemon) = test_daemon();
        daemon.capture_conversation(capture("42", "hello")).await.unwrap();

        // Build synchronously through the worker handler path.
        let task_id = daemon
            .enqueue_context_build(ContextBuildParams {
                session_id: SessionId::Number(42),
                project_path: "/p".into(),
                personality: "tsun".into(),
                context_depth: 5,
                include_entities: false,
                max_tokens: 2000,
                context_mode: "smart".into(),
                current_prompt: String::new(),
            })
            .await
            .unwrap();
        assert!(task_id > 0);

        daemon.start_workers().await;
        let mut found = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            found = daemon.get_context("42", 1).await.unwrap();
            if found.is_some() {
                break;
            }
        }
        daemon.shutdown().await;
        let context = found.expect("context should be built within the wait window");
        assert!(context.contains("hello"));
    }

    #[tokio::test]
    async fn status_snapshot_counts() {
        let (_d, daemon) = test_daemon();
        daemon.capture_conversation(capture("42", "hello")).await.unwrap();
        let status = daemon.status().await.unwrap();
        assert_eq!(status.storage.sessions_total, 1);
        assert_eq!(status.storage.conversations_total, 1);
        assert!(status.queue.by_status.contains_key("pending"));
    }
}
