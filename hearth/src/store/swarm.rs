//! Swarm, swarm-agent, and scratchpad persistence. Status transitions that
//! race (start, cancel) are compare-and-set on the prior status.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{map_sql, now_millis, Store, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwarmStatus::Pending => "pending",
            SwarmStatus::Running => "running",
            SwarmStatus::Completed => "completed",
            SwarmStatus::Failed => "failed",
            SwarmStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SwarmStatus::Pending),
            "running" => Some(SwarmStatus::Running),
            "completed" => Some(SwarmStatus::Completed),
            "failed" => Some(SwarmStatus::Failed),
            "cancelled" => Some(SwarmStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwarmStatus::Completed | SwarmStatus::Failed | SwarmStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Skipped => "skipped",
            AgentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AgentStatus::Pending),
            "running" => Some(AgentStatus::Running),
            "completed" => Some(AgentStatus::Completed),
            "failed" => Some(AgentStatus::Failed),
            "skipped" => Some(AgentStatus::Skipped),
            "cancelled" => Some(AgentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Pending | AgentStatus::Running)
    }
}

/// How a dependent agent receives its parent's output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeMode {
    #[default]
    Summary,
    Full,
    None,
}

/// One resolved dependency edge of a swarm agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependsOn {
    pub agent_id: String,
    #[serde(default)]
    pub include: IncludeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NewSwarm {
    pub name: String,
    pub description: String,
    pub working_dir: String,
    pub branch_prefix: Option<String>,
    pub base_branch: Option<String>,
    pub auto_synthesize: bool,
    pub synthesis_prompt: Option<String>,
    pub skip_synthesis_on_failure: bool,
    pub supervise: bool,
    pub supervisor_warn_secs: Option<i64>,
    pub supervisor_cancel_secs: Option<i64>,
    pub parent_session_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SwarmRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub working_dir: String,
    pub branch_prefix: Option<String>,
    pub base_branch: Option<String>,
    pub status: SwarmStatus,
    pub auto_synthesize: bool,
    pub synthesis_prompt: Option<String>,
    pub skip_synthesis_on_failure: bool,
    pub supervise: bool,
    pub supervisor_warn_secs: Option<i64>,
    pub supervisor_cancel_secs: Option<i64>,
    pub parent_session_id: Option<String>,
    pub synthesis_output: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct NewSwarmAgent {
    pub swarm_id: String,
    pub name: String,
    pub role: String,
    pub mode: String,
    pub prompt: String,
    pub is_synthesis: bool,
    pub personality: Option<String>,
    pub plugins: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub sandbox: bool,
    pub timeout_secs: Option<i64>,
    pub goal: Option<String>,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub max_tasks: Option<i64>,
    pub max_duration_secs: Option<i64>,
    pub idle_timeout_secs: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SwarmAgentRow {
    pub id: String,
    pub swarm_id: String,
    pub name: String,
    pub role: String,
    pub mode: String,
    pub prompt: String,
    pub is_synthesis: bool,
    pub personality: Option<String>,
    pub plugins: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub sandbox: bool,
    pub depends_on: Vec<DependsOn>,
    pub timeout_secs: Option<i64>,
    pub goal: Option<String>,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub max_tasks: Option<i64>,
    pub max_duration_secs: Option<i64>,
    pub idle_timeout_secs: Option<i64>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub current_task_id: Option<String>,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub output_summary: Option<String>,
    pub error_message: Option<String>,
    pub tool_count: i64,
    pub session_id: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScratchpadEntry {
    pub swarm_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub agent_id: String,
    pub agent_name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

fn parse_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

const AGENT_COLUMNS: &str = "id, swarm_id, name, role, mode, prompt, is_synthesis, personality, \
     plugins, allowed_tools, model, sandbox, depends_on, timeout_secs, goal, capabilities, task_types, \
     max_tasks, max_duration_secs, idle_timeout_secs, tasks_completed, tasks_failed, \
     current_task_id, status, output, output_summary, error_message, tool_count, session_id, \
     started_at, completed_at";

fn row_to_agent(r: &Row<'_>) -> rusqlite::Result<SwarmAgentRow> {
    Ok(SwarmAgentRow {
        id: r.get(0)?,
        swarm_id: r.get(1)?,
        name: r.get(2)?,
        role: r.get(3)?,
        mode: r.get(4)?,
        prompt: r.get(5)?,
        is_synthesis: r.get::<_, i64>(6)? != 0,
        personality: r.get(7)?,
        plugins: parse_list(&r.get::<_, String>(8)?),
        allowed_tools: parse_list(&r.get::<_, String>(9)?),
        model: r.get(10)?,
        sandbox: r.get::<_, i64>(11)? != 0,
        depends_on: serde_json::from_str(&r.get::<_, String>(12)?).unwrap_or_default(),
        timeout_secs: r.get(13)?,
        goal: r.get(14)?,
        capabilities: parse_list(&r.get::<_, String>(15)?),
        task_types: parse_list(&r.get::<_, String>(16)?),
        max_tasks: r.get(17)?,
        max_duration_secs: r.get(18)?,
        idle_timeout_secs: r.get(19)?,
        tasks_completed: r.get(20)?,
        tasks_failed: r.get(21)?,
        current_task_id: r.get(22)?,
        status: AgentStatus::parse(&r.get::<_, String>(23)?).unwrap_or(AgentStatus::Pending),
        output: r.get(24)?,
        output_summary: r.get(25)?,
        error_message: r.get(26)?,
        tool_count: r.get(27)?,
        session_id: r.get(28)?,
        started_at: r.get(29)?,
        completed_at: r.get(30)?,
    })
}

fn row_to_swarm(r: &Row<'_>) -> rusqlite::Result<SwarmRow> {
    Ok(SwarmRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        working_dir: r.get(3)?,
        branch_prefix: r.get(4)?,
        base_branch: r.get(5)?,
        status: SwarmStatus::parse(&r.get::<_, String>(6)?).unwrap_or(SwarmStatus::Pending),
        auto_synthesize: r.get::<_, i64>(7)? != 0,
        synthesis_prompt: r.get(8)?,
        skip_synthesis_on_failure: r.get::<_, i64>(9)? != 0,
        supervise: r.get::<_, i64>(10)? != 0,
        supervisor_warn_secs: r.get(11)?,
        supervisor_cancel_secs: r.get(12)?,
        parent_session_id: r.get(13)?,
        synthesis_output: r.get(14)?,
        created_at: r.get(15)?,
        started_at: r.get(16)?,
        completed_at: r.get(17)?,
    })
}

const SWARM_COLUMNS: &str = "id, name, description, working_dir, branch_prefix, base_branch, \
     status, auto_synthesize, synthesis_prompt, skip_synthesis_on_failure, supervise, \
     supervisor_warn_secs, supervisor_cancel_secs, parent_session_id, synthesis_output, \
     created_at, started_at, completed_at";

impl Store {
    pub async fn insert_swarm(&self, new: NewSwarm) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let ret = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO swarms (id, name, description, working_dir, branch_prefix, \
                 base_branch, auto_synthesize, synthesis_prompt, skip_synthesis_on_failure, \
                 supervise, supervisor_warn_secs, supervisor_cancel_secs, parent_session_id, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    id,
                    new.name,
                    new.description,
                    new.working_dir,
                    new.branch_prefix,
                    new.base_branch,
                    new.auto_synthesize as i64,
                    new.synthesis_prompt,
                    new.skip_synthesis_on_failure as i64,
                    new.supervise as i64,
                    new.supervisor_warn_secs,
                    new.supervisor_cancel_secs,
                    new.parent_session_id,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await?;
        Ok(ret)
    }

    pub async fn insert_swarm_agent(&self, new: NewSwarmAgent) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let ret = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO swarm_agents (id, swarm_id, name, role, mode, prompt, is_synthesis, \
                 personality, plugins, allowed_tools, model, sandbox, timeout_secs, goal, \
                 capabilities, task_types, max_tasks, max_duration_secs, idle_timeout_secs) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    id,
                    new.swarm_id,
                    new.name,
                    new.role,
                    new.mode,
                    new.prompt,
                    new.is_synthesis as i64,
                    new.personality,
                    serde_json::to_string(&new.plugins)?,
                    serde_json::to_string(&new.allowed_tools)?,
                    new.model,
                    new.sandbox as i64,
                    new.timeout_secs,
                    new.goal,
                    serde_json::to_string(&new.capabilities)?,
                    serde_json::to_string(&new.task_types)?,
                    new.max_tasks,
                    new.max_duration_secs,
                    new.idle_timeout_secs,
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await?;
        Ok(ret)
    }

    pub async fn set_agent_depends_on(
        &self,
        agent_id: &str,
        depends_on: Vec<DependsOn>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET depends_on = ?2 WHERE id = ?1",
                params![agent_id, serde_json::to_string(&depends_on)?],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn swarm(&self, id: &str) -> Result<Option<SwarmRow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM swarms WHERE id = ?1", SWARM_COLUMNS),
                params![id],
                row_to_swarm,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    pub async fn swarm_agents(&self, swarm_id: &str) -> Result<Vec<SwarmAgentRow>, StoreError> {
        let swarm_id = swarm_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM swarm_agents WHERE swarm_id = ?1 ORDER BY rowid",
                    AGENT_COLUMNS
                ))
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![swarm_id], row_to_agent)
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    pub async fn swarm_agent(&self, agent_id: &str) -> Result<Option<SwarmAgentRow>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM swarm_agents WHERE id = ?1", AGENT_COLUMNS),
                params![agent_id],
                row_to_agent,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    pub async fn swarm_agent_by_name(
        &self,
        swarm_id: &str,
        name: &str,
    ) -> Result<Option<SwarmAgentRow>, StoreError> {
        let swarm_id = swarm_id.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM swarm_agents WHERE swarm_id = ?1 AND name = ?2",
                    AGENT_COLUMNS
                ),
                params![swarm_id, name],
                row_to_agent,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    /// Compare-and-set swarm status; stamps `started_at` on entry to
    /// `running` and `completed_at` on terminal states. Returns whether the
    /// transition happened.
    pub async fn swarm_status_cas(
        &self,
        id: &str,
        from: SwarmStatus,
        to: SwarmStatus,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            let n = conn
                .execute(
                    "UPDATE swarms SET status = ?3, \
                     started_at = CASE WHEN ?3 = 'running' THEN ?4 ELSE started_at END, \
                     completed_at = CASE WHEN ?3 IN ('completed','failed','cancelled') THEN ?4 \
                                    ELSE completed_at END \
                     WHERE id = ?1 AND status = ?2",
                    params![id, from.as_str(), to.as_str(), now],
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn set_swarm_synthesis_output(
        &self,
        id: &str,
        output: &str,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let output = output.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarms SET synthesis_output = ?2 WHERE id = ?1",
                params![id, output],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn agent_mark_running(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET status = 'running', session_id = ?2, started_at = ?3 \
                 WHERE id = ?1",
                params![agent_id, session_id, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn agent_mark_completed(
        &self,
        agent_id: &str,
        output: &str,
        output_summary: Option<String>,
        tool_count: i64,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        let output = output.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET status = 'completed', output = ?2, output_summary = ?3, \
                 tool_count = ?4, completed_at = ?5 WHERE id = ?1",
                params![agent_id, output, output_summary, tool_count, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn agent_mark_failed(&self, agent_id: &str, error: &str) -> Result<(), StoreError> {
        self.agent_terminal(agent_id, AgentStatus::Failed, Some(error.to_string()))
            .await
    }

    pub async fn agent_mark_skipped(&self, agent_id: &str, reason: &str) -> Result<(), StoreError> {
        self.agent_terminal(agent_id, AgentStatus::Skipped, Some(reason.to_string()))
            .await
    }

    pub async fn agent_mark_cancelled(&self, agent_id: &str) -> Result<(), StoreError> {
        self.agent_terminal(agent_id, AgentStatus::Cancelled, None)
            .await
    }

    async fn agent_terminal(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET status = ?2, error_message = ?3, completed_at = ?4 \
                 WHERE id = ?1",
                params![agent_id, status.as_str(), error, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Points an autonomous agent at the task it is working on (or clears it).
    pub async fn agent_set_current_task(
        &self,
        agent_id: &str,
        current_task_id: Option<String>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET current_task_id = ?2 WHERE id = ?1",
                params![agent_id, current_task_id],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Records progress of an autonomous agent's task loop.
    pub async fn agent_record_task_result(
        &self,
        agent_id: &str,
        succeeded: bool,
        current_task_id: Option<String>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE swarm_agents SET \
                 tasks_completed = tasks_completed + ?2, \
                 tasks_failed = tasks_failed + ?3, \
                 current_task_id = ?4 WHERE id = ?1",
                params![
                    agent_id,
                    succeeded as i64,
                    (!succeeded) as i64,
                    current_task_id
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Distinct plugins declared across swarm agents, for the REST listing.
    pub async fn known_plugins(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT plugins FROM swarm_agents")
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(map_sql)?;
            let mut seen = std::collections::BTreeSet::new();
            for row in rows {
                let raw = row.map_err(map_sql)?;
                for plugin in parse_list(&raw) {
                    seen.insert(plugin);
                }
            }
            Ok(seen.into_iter().collect())
        })
        .await
    }

    // --- scratchpad -------------------------------------------------------

    /// Atomic last-writer-wins upsert.
    pub async fn scratchpad_set(
        &self,
        swarm_id: &str,
        key: &str,
        value: serde_json::Value,
        agent_id: &str,
        agent_name: &str,
    ) -> Result<(), StoreError> {
        let swarm_id = swarm_id.to_string();
        let key = key.to_string();
        let agent_id = agent_id.to_string();
        let agent_name = agent_name.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO swarm_scratchpad (swarm_id, key, value, agent_id, agent_name, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
                 ON CONFLICT(swarm_id, key) DO UPDATE SET value = excluded.value, \
                 agent_id = excluded.agent_id, agent_name = excluded.agent_name, \
                 updated_at = excluded.updated_at",
                params![swarm_id, key, serde_json::to_string(&value)?, agent_id, agent_name, now],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn scratchpad_get(
        &self,
        swarm_id: &str,
        key: &str,
    ) -> Result<Option<ScratchpadEntry>, StoreError> {
        let swarm_id = swarm_id.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT swarm_id, key, value, agent_id, agent_name, created_at, updated_at \
                 FROM swarm_scratchpad WHERE swarm_id = ?1 AND key = ?2",
                params![swarm_id, key],
                row_to_scratchpad,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    pub async fn scratchpad_list(
        &self,
        swarm_id: &str,
    ) -> Result<Vec<ScratchpadEntry>, StoreError> {
        let swarm_id = swarm_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT swarm_id, key, value, agent_id, agent_name, created_at, updated_at \
                     FROM swarm_scratchpad WHERE swarm_id = ?1 ORDER BY key",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![swarm_id], row_to_scratchpad)
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    pub async fn scratchpad_delete(&self, swarm_id: &str, key: &str) -> Result<bool, StoreError> {
        let swarm_id = swarm_id.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM swarm_scratchpad WHERE swarm_id = ?1 AND key = ?2",
                    params![swarm_id, key],
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }
}

fn row_to_scratchpad(r: &Row<'_>) -> rusqlite::Result<ScratchpadEntry> {
    Ok(ScratchpadEntry {
        swarm_id: r.get(0)?,
        key: r.get(1)?,
        value: serde_json::from_str(&r.get::<_, String>(2)?).unwrap_or(serde_json::Value::Null),
        agent_id: r.get(3)?,
        agent_name: r.get(4)?,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_swarm() -> (tempfile::TempDir, Store, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let swarm_id = store
            .insert_swarm(NewSwarm {
                name: "review".into(),
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (dir, store, swarm_id)
    }

    #[tokio::test]
    async fn status_cas_only_fires_from_expected_state() {
        let (_d, store, swarm_id) = store_with_swarm().await;
        assert!(store
            .swarm_status_cas(&swarm_id, SwarmStatus::Pending, SwarmStatus::Running)
            .await
            .unwrap());
        // Double-start loses the CAS.
        assert!(!store
            .swarm_status_cas(&swarm_id, SwarmStatus::Pending, SwarmStatus::Running)
            .await
            .unwrap());
        let row = store.swarm(&swarm_id).await.unwrap().unwrap();
        assert_eq!(row.status, SwarmStatus::Running);
        assert!(row.started_at.is_some());
    }

    #[tokio::test]
    async fn agent_rows_roundtrip_with_depends_on() {
        let (_d, store, swarm_id) = store_with_swarm().await;
        let a = store
            .insert_swarm_agent(NewSwarmAgent {
                swarm_id: swarm_id.clone(),
                name: "planner".into(),
                role: "worker".into(),
                mode: "assigned".into(),
                prompt: "plan".into(),
                sandbox: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .insert_swarm_agent(NewSwarmAgent {
                swarm_id: swarm_id.clone(),
                name: "builder".into(),
                role: "worker".into(),
                mode: "assigned".into(),
                prompt: "build".into(),
                sandbox: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set_agent_depends_on(
                &b,
                vec![DependsOn {
                    agent_id: a.clone(),
                    include: IncludeMode::Full,
                    condition: None,
                }],
            )
            .await
            .unwrap();

        let agents = store.swarm_agents(&swarm_id).await.unwrap();
        assert_eq!(agents.len(), 2);
        let builder = store
            .swarm_agent_by_name(&swarm_id, "builder")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(builder.depends_on.len(), 1);
        assert_eq!(builder.depends_on[0].agent_id, a);
        assert_eq!(builder.depends_on[0].include, IncludeMode::Full);
    }

    #[tokio::test]
    async fn duplicate_agent_name_is_rejected_by_schema() {
        let (_d, store, swarm_id) = store_with_swarm().await;
        let mk = |sid: String| NewSwarmAgent {
            swarm_id: sid,
            name: "dup".into(),
            prompt: "p".into(),
            mode: "assigned".into(),
            ..Default::default()
        };
        store.insert_swarm_agent(mk(swarm_id.clone())).await.unwrap();
        assert!(store.insert_swarm_agent(mk(swarm_id)).await.is_err());
    }

    #[tokio::test]
    async fn scratchpad_is_last_writer_wins() {
        let (_d, store, swarm_id) = store_with_swarm().await;
        store
            .scratchpad_set(&swarm_id, "plan", serde_json::json!({"v": 1}), "a1", "planner")
            .await
            .unwrap();
        store
            .scratchpad_set(&swarm_id, "plan", serde_json::json!({"v": 2}), "a2", "builder")
            .await
            .unwrap();

        let entry = store.scratchpad_get(&swarm_id, "plan").await.unwrap().unwrap();
        assert_eq!(entry.value["v"], 2);
        assert_eq!(entry.agent_name, "builder");

        assert_eq!(store.scratchpad_list(&swarm_id).await.unwrap().len(), 1);
        assert!(store.scratchpad_delete(&swarm_id, "plan").await.unwrap());
        assert!(!store.scratchpad_delete(&swarm_id, "plan").await.unwrap());
    }
}
