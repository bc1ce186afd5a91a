//! Swarm orchestration: a user-declared DAG of LLM agents with optional
//! synthesis, supervisor, and memory-steward conventions.
//!
//! [`Orchestrator`] validates and persists a [`SwarmSpec`], appends the
//! convention nodes, and hands running swarms to the executor, which drives
//! one task per agent with watch-channel dependency gating.

pub mod autonomous;
pub mod dag;
pub mod executor;
pub mod orchestrator;

pub use orchestrator::Orchestrator;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorKind, Kinded};
use crate::llm::LlmError;
use crate::store::swarm::IncludeMode;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("agent timed out after {0} s")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl Kinded for SwarmError {
    fn kind(&self) -> ErrorKind {
        match self {
            SwarmError::Validation(_) | SwarmError::Cycle { .. } => ErrorKind::Validation,
            SwarmError::NotFound(_) => ErrorKind::NotFound,
            SwarmError::Conflict(_) => ErrorKind::Conflict,
            SwarmError::Timeout(_) => ErrorKind::Timeout,
            SwarmError::Cancelled => ErrorKind::Cancelled,
            SwarmError::Store(e) => e.kind(),
            SwarmError::Llm(e) => e.kind(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Assigned,
    Autonomous,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Assigned => "assigned",
            AgentMode::Autonomous => "autonomous",
        }
    }
}

/// One dependency edge in a spec, by agent name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependsOnSpec {
    pub agent: String,
    #[serde(default)]
    pub include: IncludeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_sandbox() -> bool {
    true
}

/// One declared agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default = "AgentSpec::default_role")]
    pub role: String,
    #[serde(default)]
    pub mode: AgentMode,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
    #[serde(default)]
    pub depends_on: Vec<DependsOnSpec>,
    /// Wall-clock override for this agent; the daemon default applies when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    // Autonomous-mode fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<i64>,
}

impl AgentSpec {
    fn default_role() -> String {
        "worker".to_string()
    }

    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Self::default_role(),
            mode: AgentMode::Assigned,
            prompt: prompt.into(),
            personality: None,
            plugins: Vec::new(),
            allowed_tools: Vec::new(),
            model: None,
            sandbox: true,
            depends_on: Vec::new(),
            timeout_secs: None,
            goal: None,
            capabilities: Vec::new(),
            task_types: Vec::new(),
            max_tasks: None,
            max_duration_secs: None,
            idle_timeout_secs: None,
        }
    }

    pub fn depends_on_full(mut self, agent: impl Into<String>) -> Self {
        self.depends_on.push(DependsOnSpec {
            agent: agent.into(),
            include: IncludeMode::Full,
            condition: None,
        });
        self
    }

    pub fn depends_on_conditional(
        mut self,
        agent: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.depends_on.push(DependsOnSpec {
            agent: agent.into(),
            include: IncludeMode::Full,
            condition: Some(condition.into()),
        });
        self
    }
}

/// A swarm creation request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SwarmSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub auto_synthesize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_prompt: Option<String>,
    #[serde(default)]
    pub skip_synthesis_on_failure: bool,
    #[serde(default)]
    pub auto_supervise: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_warn_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_cancel_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

/// Roles of the auto-appended convention nodes.
pub const ROLE_SYNTHESIS: &str = "synthesis";
pub const ROLE_SUPERVISOR: &str = "supervisor";
pub const ROLE_MEMORY_STEWARD: &str = "memory_steward";

/// Whether an agent counts as a worker for swarm-status purposes.
pub(crate) fn is_worker_role(role: &str) -> bool {
    !matches!(role, ROLE_SYNTHESIS | ROLE_SUPERVISOR | ROLE_MEMORY_STEWARD)
}
