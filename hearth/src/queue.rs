//! Durable prioritized task queue backing all background processing.
//!
//! One row per task. The claim transition is a single `UPDATE ... RETURNING`
//! compare-and-set, so concurrent workers never observe the same row in
//! `processing`. Ordering is `priority DESC, created_at ASC` (id breaks
//! same-millisecond ties).

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::store::{map_sql, now_millis, Store, StoreError};

/// Retries before a task is parked as `failed`.
pub const RETRY_CAP: i64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Embedding,
    Summarization,
    EntityExtraction,
    ContextBuilding,
    Exploration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Embedding => "embedding",
            TaskType::Summarization => "summarization",
            TaskType::EntityExtraction => "entity_extraction",
            TaskType::ContextBuilding => "context_building",
            TaskType::Exploration => "exploration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "embedding" => Some(TaskType::Embedding),
            "summarization" => Some(TaskType::Summarization),
            "entity_extraction" => Some(TaskType::EntityExtraction),
            "context_building" => Some(TaskType::ContextBuilding),
            "exploration" => Some(TaskType::Exploration),
            _ => None,
        }
    }

    pub const ALL: [TaskType; 5] = [
        TaskType::Embedding,
        TaskType::Summarization,
        TaskType::EntityExtraction,
        TaskType::ContextBuilding,
        TaskType::Exploration,
    ];
}

#[derive(Clone, Debug)]
pub struct QueueTask {
    pub id: i64,
    pub task_type: TaskType,
    pub model_name: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub priority: i64,
    pub session_id: Option<String>,
    pub retry_count: i64,
}

/// Aggregate counts for `queue.status`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStats {
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub pending_by_model: std::collections::BTreeMap<String, i64>,
}

fn row_to_task(r: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, i64, Option<String>, i64)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn into_task(
    raw: (i64, String, String, String, String, i64, Option<String>, i64),
) -> Result<QueueTask, StoreError> {
    let (id, task_type, model_name, content, metadata, priority, session_id, retry_count) = raw;
    Ok(QueueTask {
        id,
        task_type: TaskType::parse(&task_type)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown task type: {}", task_type)))?,
        model_name,
        content,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        priority,
        session_id,
        retry_count,
    })
}

const CLAIM_COLUMNS: &str =
    "id, task_type, model_name, content, metadata, priority, session_id, retry_count";

impl Store {
    /// Inserts a `pending` task and returns its id.
    pub async fn queue_add(
        &self,
        task_type: TaskType,
        model_name: &str,
        content: &str,
        metadata: serde_json::Value,
        priority: i64,
        session_id: Option<String>,
    ) -> Result<i64, StoreError> {
        let model_name = model_name.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_queue (task_type, model_name, content, metadata, priority, \
                 session_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task_type.as_str(),
                    model_name,
                    content,
                    serde_json::to_string(&metadata)?,
                    priority,
                    session_id,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Atomically claims the highest-priority oldest `pending` row matching
    /// the filters, transitioning it to `processing`.
    pub async fn queue_claim(
        &self,
        type_filter: Option<Vec<TaskType>>,
        model_bucket: Option<String>,
    ) -> Result<Option<QueueTask>, StoreError> {
        let raw = self
            .with_conn(move |conn| {
                let type_clause = match &type_filter {
                    None => "1=1".to_string(),
                    Some(types) if types.is_empty() => "1=1".to_string(),
                    Some(types) => {
                        let names: Vec<String> =
                            types.iter().map(|t| format!("'{}'", t.as_str())).collect();
                        format!("task_type IN ({})", names.join(","))
                    }
                };
                conn.query_row(
                    &format!(
                        "UPDATE task_queue SET status = 'processing', processing_at = ?1 \
                         WHERE id = (SELECT id FROM task_queue \
                                     WHERE status = 'pending' AND {} \
                                       AND (?2 IS NULL OR model_name = ?2) \
                                     ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) \
                         AND status = 'pending' RETURNING {}",
                        type_clause, CLAIM_COLUMNS
                    ),
                    params![now_millis(), model_bucket],
                    row_to_task,
                )
                .optional()
                .map_err(map_sql)
            })
            .await?;
        raw.map(into_task).transpose()
    }

    pub async fn queue_complete(&self, task_id: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_queue SET status = 'completed' WHERE id = ?1",
                params![task_id],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Increments the retry count; under the cap the row returns to
    /// `pending`, otherwise it is parked as `failed`.
    pub async fn queue_fail(&self, task_id: i64, error: &str) -> Result<(), StoreError> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_queue SET retry_count = retry_count + 1, last_error = ?2, \
                 processing_at = NULL, \
                 status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END \
                 WHERE id = ?1",
                params![task_id, error, RETRY_CAP],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.with_conn(move |conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM task_queue GROUP BY status")
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                .map_err(map_sql)?;
            for row in rows {
                let (status, n) = row.map_err(map_sql)?;
                stats.by_status.insert(status, n);
            }
            let mut stmt = conn
                .prepare(
                    "SELECT model_name, COUNT(*) FROM task_queue WHERE status = 'pending' \
                     GROUP BY model_name",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                .map_err(map_sql)?;
            for row in rows {
                let (model, n) = row.map_err(map_sql)?;
                stats.pending_by_model.insert(model, n);
            }
            Ok(stats)
        })
        .await
    }

    /// Crash recovery: rows stuck in `processing` longer than the threshold
    /// lost their worker; return them to `pending`.
    pub async fn queue_reclaim_stale(&self, threshold_secs: i64) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let cutoff = now_millis() - threshold_secs * 1000;
            let n = conn
                .execute(
                    "UPDATE task_queue SET status = 'pending', processing_at = NULL \
                     WHERE status = 'processing' AND processing_at < ?1",
                    params![cutoff],
                )
                .map_err(map_sql)?;
            if n > 0 {
                tracing::info!(reclaimed = n, "reclaimed stale processing tasks");
            }
            Ok(n)
        })
        .await
    }
}
