//! Worker pool: pulls tasks from the queue on a tick and dispatches them to
//! typed handlers under per-type concurrency caps and deadlines.
//!
//! Shutdown is cooperative: cancelling the pool's token stops new claims and
//! fires each handler's per-task child token, which interrupts in-flight LLM
//! calls; `shutdown` returns once the interrupted handlers have recorded
//! their task status.

pub mod handlers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::TaskType;
use crate::store::Store;

pub use handlers::{WorkerError, WorkerServices};

/// Rows stuck in `processing` longer than this are reclaimed.
const STALE_THRESHOLD_SECS: i64 = 600;
const RECLAIM_EVERY: u32 = 120; // ticks

fn concurrency_cap(task_type: TaskType) -> usize {
    match task_type {
        TaskType::Embedding => 4,
        TaskType::Summarization => 2,
        TaskType::EntityExtraction => 2,
        TaskType::ContextBuilding => 2,
        TaskType::Exploration => 1,
    }
}

fn deadline(task_type: TaskType) -> Duration {
    match task_type {
        TaskType::Embedding => Duration::from_secs(30),
        TaskType::Summarization => Duration::from_secs(120),
        TaskType::EntityExtraction => Duration::from_secs(120),
        TaskType::ContextBuilding => Duration::from_secs(60),
        TaskType::Exploration => Duration::from_secs(300),
    }
}

/// Handle to a running pool.
pub struct WorkerPool {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct PoolState {
    store: Store,
    services: Arc<WorkerServices>,
    in_flight: Mutex<HashMap<TaskType, usize>>,
    /// Last model claimed for, per task type: a worker drains one model
    /// bucket before switching to minimize model cold-starts.
    last_model: Mutex<HashMap<TaskType, String>>,
}

impl WorkerPool {
    /// Starts the tick loop. `tick` is exposed for tests; the daemon uses
    /// 500 ms.
    pub fn start(store: Store, services: Arc<WorkerServices>, tick: Duration) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let state = Arc::new(PoolState {
            store,
            services,
            in_flight: Mutex::new(HashMap::new()),
            last_model: Mutex::new(HashMap::new()),
        });
        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        tracker.spawn(run_loop(state, loop_cancel, loop_tracker, tick));
        Self { cancel, tracker }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops claiming and waits for in-flight handlers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_loop(
    state: Arc<PoolState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        ticks = ticks.wrapping_add(1);
        if ticks % RECLAIM_EVERY == 0 {
            if let Err(e) = state.store.queue_reclaim_stale(STALE_THRESHOLD_SECS).await {
                tracing::warn!("stale reclaim failed: {}", e);
            }
        }
        for task_type in TaskType::ALL {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let current = *state
                    .in_flight
                    .lock()
                    .unwrap()
                    .get(&task_type)
                    .unwrap_or(&0);
                if current >= concurrency_cap(task_type) {
                    break;
                }
                match claim(&state, task_type).await {
                    Ok(Some(task)) => {
                        *state
                            .in_flight
                            .lock()
                            .unwrap()
                            .entry(task_type)
                            .or_insert(0) += 1;
                        let state = state.clone();
                        let task_cancel = cancel.child_token();
                        tracker.spawn(async move {
                            run_one(&state, task, task_cancel).await;
                            if let Some(n) =
                                state.in_flight.lock().unwrap().get_mut(&task_type)
                            {
                                *n = n.saturating_sub(1);
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("queue claim failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Claims preferring the model bucket this type drained last.
async fn claim(
    state: &PoolState,
    task_type: TaskType,
) -> Result<Option<crate::queue::QueueTask>, crate::store::StoreError> {
    let preferred = state.last_model.lock().unwrap().get(&task_type).cloned();
    let mut task = None;
    if let Some(model) = preferred {
        task = state
            .store
            .queue_claim(Some(vec![task_type]), Some(model))
            .await?;
    }
    if task.is_none() {
        task = state.store.queue_claim(Some(vec![task_type]), None).await?;
    }
    if let Some(ref t) = task {
        state
            .last_model
            .lock()
            .unwrap()
            .insert(task_type, t.model_name.clone());
    }
    Ok(task)
}

async fn run_one(state: &PoolState, task: crate::queue::QueueTask, cancel: CancellationToken) {
    let task_id = task.id;
    let task_type = task.task_type;
    let result = tokio::time::timeout(
        deadline(task_type),
        handlers::handle(&state.services, &task, cancel),
    )
    .await;
    let outcome = match result {
        Ok(Ok(())) => state.store.queue_complete(task_id).await,
        Ok(Err(e)) => {
            tracing::warn!(task_id, kind = task_type.as_str(), "task failed: {}", e);
            state.store.queue_fail(task_id, &e.to_string()).await
        }
        Err(_) => {
            tracing::warn!(task_id, kind = task_type.as_str(), "task deadline exceeded");
            state.store.queue_fail(task_id, "deadline exceeded").await
        }
    };
    if let Err(e) = outcome {
        tracing::error!(task_id, "status update failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::explore::{Explorer, NullFactIntegration, NullKnowledgeGraph};
    use crate::llm::{MockEmbedder, MockLlm};
    use crate::store::conversation::NewConversation;
    use crate::store::session::NewSession;

    const DIM: usize = 8;

    fn services(store: &Store, llm: MockLlm) -> Arc<WorkerServices> {
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let llm = Arc::new(llm);
        Arc::new(WorkerServices {
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
        })
    }

    #[tokio::test]
    async fn pool_processes_embedding_task_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), DIM).unwrap();
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let cid = store
            .store_conversation(NewConversation {
                session_id: sid,
                prompt: "embed me".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .queue_add(
                TaskType::Embedding,
                "m",
                "embed me",
                serde_json::json!({"conversation_id": cid}),
                0,
                None,
            )
            .await
            .unwrap();

        let pool = WorkerPool::start(
            store.clone(),
            services(&store, MockLlm::new("")),
            Duration::from_millis(20),
        );
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stats = store.queue_stats().await.unwrap();
            if stats.by_status.get("completed") == Some(&1) {
                break;
            }
        }
        pool.shutdown().await;

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert!(store.conversation_embedding(cid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_pool_claims_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), DIM).unwrap();
        let pool = WorkerPool::start(
            store.clone(),
            services(&store, MockLlm::new("")),
            Duration::from_millis(20),
        );
        pool.shutdown().await;

        store
            .queue_add(
                TaskType::Embedding,
                "m",
                "late",
                serde_json::json!({"conversation_id": 1}),
                0,
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.by_status.get("pending"), Some(&1));
    }
}
