//! Project tasks: queued work shared across agents, including the curiosity
//! tasks consumed by the exploration loop. Claims are single-statement
//! compare-and-set transitions so concurrent claimers never double-claim.

use rusqlite::{params, OptionalExtension, Row};

use super::{map_sql, now_millis, Store, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectTaskStatus {
    Ready,
    Claimed,
    InProgress,
    Done,
    Blocked,
    Cancelled,
}

impl ProjectTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectTaskStatus::Ready => "ready",
            ProjectTaskStatus::Claimed => "claimed",
            ProjectTaskStatus::InProgress => "in_progress",
            ProjectTaskStatus::Done => "done",
            ProjectTaskStatus::Blocked => "blocked",
            ProjectTaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewProjectTask {
    pub working_dir: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub extra: serde_json::Value,
    /// Task id this one was discovered from (follow-up lineage).
    pub discovered_from: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProjectTaskRow {
    pub id: String,
    pub working_dir: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub status: String,
    pub claimed_by_agent: Option<String>,
    pub claimed_by_session: Option<String>,
    pub attempt_count: i64,
    pub extra: serde_json::Value,
    pub discovered_from: Option<String>,
}

fn row_to_task(r: &Row<'_>) -> rusqlite::Result<ProjectTaskRow> {
    Ok(ProjectTaskRow {
        id: r.get(0)?,
        working_dir: r.get(1)?,
        title: r.get(2)?,
        description: r.get(3)?,
        task_type: r.get(4)?,
        priority: r.get(5)?,
        status: r.get(6)?,
        claimed_by_agent: r.get(7)?,
        claimed_by_session: r.get(8)?,
        attempt_count: r.get(9)?,
        extra: serde_json::from_str(&r.get::<_, String>(10)?).unwrap_or_default(),
        discovered_from: r.get(11)?,
    })
}

const TASK_COLUMNS: &str = "id, working_dir, title, description, task_type, priority, status, \
     claimed_by_agent, claimed_by_session, attempt_count, extra, discovered_from";

impl Store {
    pub async fn create_project_task(&self, new: NewProjectTask) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let ret = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO project_tasks (id, working_dir, title, description, task_type, \
                 priority, extra, discovered_from, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    new.working_dir,
                    new.title,
                    new.description,
                    if new.task_type.is_empty() { "task" } else { new.task_type.as_str() },
                    new.priority,
                    serde_json::to_string(&new.extra)?,
                    new.discovered_from,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await?;
        Ok(ret)
    }

    pub async fn project_task(&self, id: &str) -> Result<Option<ProjectTaskRow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM project_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                row_to_task,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    /// Claims a specific task: it must be `ready`. Transitions to
    /// `in_progress`, stamps the claimer, and increments the attempt count.
    /// Returns `None` when the task is missing or not claimable.
    pub async fn claim_project_task_by_id(
        &self,
        id: &str,
        agent: &str,
        session: Option<String>,
    ) -> Result<Option<ProjectTaskRow>, StoreError> {
        let id = id.to_string();
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "UPDATE project_tasks SET status = 'in_progress', claimed_by_agent = ?2, \
                     claimed_by_session = ?3, attempt_count = attempt_count + 1, updated_at = ?4 \
                     WHERE id = ?1 AND status = 'ready' RETURNING {}",
                    TASK_COLUMNS
                ),
                params![id, agent, session, now_millis()],
                row_to_task,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    /// Claims the highest-priority oldest `ready` task matching the type
    /// filter (empty = any) for an autonomous agent.
    pub async fn claim_next_project_task(
        &self,
        working_dir: &str,
        task_types: Vec<String>,
        agent: &str,
        session: Option<String>,
    ) -> Result<Option<ProjectTaskRow>, StoreError> {
        let working_dir = working_dir.to_string();
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            let type_filter = if task_types.is_empty() {
                "1=1".to_string()
            } else {
                let quoted: Vec<String> = task_types
                    .iter()
                    .map(|t| format!("'{}'", t.replace('\'', "''")))
                    .collect();
                format!("task_type IN ({})", quoted.join(","))
            };
            conn.query_row(
                &format!(
                    "UPDATE project_tasks SET status = 'in_progress', claimed_by_agent = ?2, \
                     claimed_by_session = ?3, attempt_count = attempt_count + 1, updated_at = ?4 \
                     WHERE id = (SELECT id FROM project_tasks \
                                 WHERE status = 'ready' AND working_dir = ?1 AND {} \
                                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) \
                     AND status = 'ready' RETURNING {}",
                    type_filter, TASK_COLUMNS
                ),
                params![working_dir, agent, session, now_millis()],
                row_to_task,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    /// Marks a task `done`, merging `extra_merge` keys into its extra record.
    pub async fn complete_project_task(
        &self,
        id: &str,
        extra_merge: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.finish_project_task(id, ProjectTaskStatus::Done, extra_merge)
            .await
    }

    /// Returns a task to `ready` (e.g. after an empty or failed run),
    /// recording the error in its extra record.
    pub async fn release_project_task(
        &self,
        id: &str,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let merge = match error {
            Some(e) => serde_json::json!({ "last_error": e }),
            None => serde_json::Value::Object(Default::default()),
        };
        self.finish_project_task(id, ProjectTaskStatus::Ready, merge)
            .await
    }

    async fn finish_project_task(
        &self,
        id: &str,
        status: ProjectTaskStatus,
        extra_merge: serde_json::Value,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_sql)?;
            let raw: String = tx
                .query_row(
                    "SELECT extra FROM project_tasks WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)?
                .ok_or(StoreError::NotFound("project task"))?;
            let mut extra: serde_json::Value =
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::Object(Default::default()));
            if let (Some(base), Some(merge)) = (extra.as_object_mut(), extra_merge.as_object()) {
                for (k, v) in merge {
                    base.insert(k.clone(), v.clone());
                }
            }
            tx.execute(
                "UPDATE project_tasks SET status = ?2, extra = ?3, updated_at = ?4, \
                 claimed_by_agent = CASE WHEN ?2 = 'ready' THEN NULL ELSE claimed_by_agent END \
                 WHERE id = ?1",
                params![id, status.as_str(), serde_json::to_string(&extra)?, now_millis()],
            )
            .map_err(map_sql)?;
            tx.commit().map_err(map_sql)
        })
        .await
    }

    /// Whether any task with this title exists under the working directory,
    /// for follow-up dedup.
    pub async fn project_task_title_exists(
        &self,
        working_dir: &str,
        title: &str,
    ) -> Result<bool, StoreError> {
        let working_dir = working_dir.to_string();
        let title = title.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM project_tasks WHERE working_dir = ?1 AND title = ?2",
                    params![working_dir, title],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    /// Whether a gap task for this entity already exists (deduped by entity
    /// UUID kept in the extra record).
    pub async fn gap_task_exists_for_entity(&self, entity_uuid: &str) -> Result<bool, StoreError> {
        let needle = format!("%\"entity_uuid\":\"{}\"%", entity_uuid);
        self.with_conn(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM project_tasks WHERE extra LIKE ?1",
                    params![needle],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    // --- exploration findings --------------------------------------------

    /// Inserts a finding; duplicates per (task, text) are ignored. Returns
    /// whether a new row was written.
    pub async fn insert_finding(
        &self,
        task_id: &str,
        finding: &str,
        confidence: f64,
        worth_sharing: bool,
        share_message: Option<String>,
    ) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        let finding = finding.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "INSERT OR IGNORE INTO exploration_findings \
                     (task_id, finding, confidence, worth_sharing, share_message, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        task_id,
                        finding,
                        confidence,
                        worth_sharing as i64,
                        share_message,
                        now_millis()
                    ],
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn findings_for_task(&self, task_id: &str) -> Result<Vec<FindingRow>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, finding, confidence, worth_sharing, share_message \
                     FROM exploration_findings WHERE task_id = ?1 ORDER BY id",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![task_id], row_to_finding)
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    /// Pops one shareable, not-yet-shared finding (marking it shared), for
    /// injection into the next gateway query.
    pub async fn take_shareable_finding(&self) -> Result<Option<FindingRow>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "UPDATE exploration_findings SET shared = 1 \
                 WHERE id = (SELECT id FROM exploration_findings \
                             WHERE worth_sharing = 1 AND shared = 0 ORDER BY id LIMIT 1) \
                 AND shared = 0 \
                 RETURNING id, task_id, finding, confidence, worth_sharing, share_message",
                [],
                row_to_finding,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    // --- mission executions ----------------------------------------------

    /// Records that an exploration run started; returns the execution id.
    pub async fn mission_started(&self, task_id: &str) -> Result<i64, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mission_executions (task_id, status, started_at) \
                 VALUES (?1, 'running', ?2)",
                params![task_id, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn mission_finished(
        &self,
        execution_id: i64,
        succeeded: bool,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE mission_executions SET status = ?2, detail = ?3, finished_at = ?4 \
                 WHERE id = ?1",
                params![
                    execution_id,
                    if succeeded { "completed" } else { "failed" },
                    detail,
                    now_millis()
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }
}

#[derive(Clone, Debug)]
pub struct FindingRow {
    pub id: i64,
    pub task_id: String,
    pub finding: String,
    pub confidence: f64,
    pub worth_sharing: bool,
    pub share_message: Option<String>,
}

fn row_to_finding(r: &Row<'_>) -> rusqlite::Result<FindingRow> {
    Ok(FindingRow {
        id: r.get(0)?,
        task_id: r.get(1)?,
        finding: r.get(2)?,
        confidence: r.get(3)?,
        worth_sharing: r.get::<_, i64>(4)? != 0,
        share_message: r.get(5)?,
    })
}
