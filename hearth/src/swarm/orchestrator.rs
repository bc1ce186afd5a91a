//! Swarm lifecycle: validate and persist specs, append the convention nodes
//! (synthesis, supervisor, memory steward), start with a compare-and-set,
//! cancel, and wait.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::executor::{self, ExecCtx};
use super::{dag, AgentMode, AgentSpec, SwarmError, SwarmSpec};
use super::{ROLE_MEMORY_STEWARD, ROLE_SUPERVISOR, ROLE_SYNTHESIS};
use crate::llm::LlmClient;
use crate::store::swarm::{
    DependsOn, IncludeMode, NewSwarm, NewSwarmAgent, SwarmAgentRow, SwarmRow, SwarmStatus,
};
use crate::store::Store;

/// Prefix rewritten onto every assigned worker prompt so the memory steward
/// has durable notes to collect.
const MEMORY_NOTE_PREFIX: &str = "As you work, record any durable decisions, discovered \
constraints, and loose ends in the swarm scratchpad under `notes/<your-name>` so the memory \
steward can preserve them.";

const DEFAULT_SYNTHESIS_PROMPT: &str = "Synthesize the outputs of every worker agent into one \
coherent result: reconcile disagreements, deduplicate, and produce the final deliverable.";

const MEMORY_STEWARD_PROMPT: &str = "You are the memory steward. Review every agent's output \
and the scratchpad notes, then write the long-term notes a future session will need: decisions \
made, open questions, and follow-ups.";

/// Tuning for agent execution.
#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub default_agent_timeout_secs: u64,
    /// Outputs longer than this (chars) get an LLM summary for `summary`
    /// include mode.
    pub summary_threshold: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            default_agent_timeout_secs: 3600,
            summary_threshold: 2000,
        }
    }
}

struct RunningSwarm {
    cancel: CancellationToken,
}

pub struct Orchestrator {
    store: Store,
    llm: Arc<dyn LlmClient>,
    config: SwarmConfig,
    running: DashMap<String, RunningSwarm>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>, config: SwarmConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            llm,
            config,
            running: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Validates and persists a swarm. Nothing is written when validation
    /// fails. Returns the swarm id; with `auto_start` the executor is already
    /// running when this returns.
    pub async fn create(self: &Arc<Self>, spec: SwarmSpec) -> Result<String, SwarmError> {
        dag::validate(&spec.agents)?;

        let swarm_id = self
            .store
            .insert_swarm(NewSwarm {
                name: spec.name.clone(),
                description: spec.description.clone(),
                working_dir: spec.working_dir.clone(),
                branch_prefix: spec.branch_prefix.clone(),
                base_branch: spec.base_branch.clone(),
                auto_synthesize: spec.auto_synthesize,
                synthesis_prompt: spec.synthesis_prompt.clone(),
                skip_synthesis_on_failure: spec.skip_synthesis_on_failure,
                supervise: spec.auto_supervise,
                supervisor_warn_secs: spec.supervisor_warn_secs,
                supervisor_cancel_secs: spec.supervisor_cancel_secs,
                parent_session_id: spec.parent_session_id.clone(),
            })
            .await?;

        // Persist declared agents; assigned workers get the memory prefix.
        let mut ids: std::collections::HashMap<String, String> = Default::default();
        for agent in &spec.agents {
            let prompt = match agent.mode {
                AgentMode::Assigned => format!("{}\n\n{}", MEMORY_NOTE_PREFIX, agent.prompt),
                AgentMode::Autonomous => agent.prompt.clone(),
            };
            let id = self
                .store
                .insert_swarm_agent(new_agent_row(&swarm_id, agent, prompt, false))
                .await?;
            ids.insert(agent.name.clone(), id);
        }

        // Resolve declared dependencies now that every row exists.
        for agent in &spec.agents {
            let resolved: Vec<DependsOn> = agent
                .depends_on
                .iter()
                .map(|d| DependsOn {
                    agent_id: ids[&d.agent].clone(),
                    include: d.include,
                    condition: d.condition.clone(),
                })
                .collect();
            if !resolved.is_empty() {
                self.store
                    .set_agent_depends_on(&ids[&agent.name], resolved)
                    .await?;
            }
        }

        let worker_ids: Vec<String> = spec.agents.iter().map(|a| ids[&a.name].clone()).collect();
        let worker_names: Vec<String> = spec.agents.iter().map(|a| a.name.clone()).collect();
        let any_unsandboxed = spec.agents.iter().any(|a| !a.sandbox);

        // Synthesis node: depends on every worker with full output.
        let mut synthesis_id = None;
        if spec.auto_synthesize {
            let mut synthesis = AgentSpec::new("synthesis", "");
            synthesis.role = ROLE_SYNTHESIS.into();
            synthesis.sandbox = !any_unsandboxed;
            let prompt = spec
                .synthesis_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYNTHESIS_PROMPT.to_string());
            let mut row = new_agent_row(&swarm_id, &synthesis, prompt, true);
            row.name = unique_name("synthesis", &worker_names);
            let id = self.store.insert_swarm_agent(row).await?;
            self.store
                .set_agent_depends_on(
                    &id,
                    worker_ids
                        .iter()
                        .map(|wid| DependsOn {
                            agent_id: wid.clone(),
                            include: IncludeMode::Full,
                            condition: None,
                        })
                        .collect(),
                )
                .await?;
            synthesis_id = Some(id);
        }

        // Supervisor node: no dependencies, watches wall-clock budgets.
        let mut supervisor_id = None;
        if spec.auto_supervise {
            let warn = spec.supervisor_warn_secs.unwrap_or(1800);
            let cancel = spec.supervisor_cancel_secs.unwrap_or(3600);
            let mut supervisor = AgentSpec::new("supervisor", "");
            supervisor.role = ROLE_SUPERVISOR.into();
            let prompt = format!(
                "You supervise the swarm's workers ({}). Warn when an agent runs past {} s; \
                 recommend cancellation past {} s. Report anomalies to the scratchpad under \
                 `supervisor/alerts`.",
                worker_names.join(", "),
                warn,
                cancel
            );
            let mut row = new_agent_row(&swarm_id, &supervisor, prompt, false);
            row.name = unique_name("supervisor", &worker_names);
            supervisor_id = Some(self.store.insert_swarm_agent(row).await?);
        }

        // Memory steward: depends on everyone (summary; synthesis full).
        let has_steward = spec.agents.iter().any(|a| a.role == ROLE_MEMORY_STEWARD);
        if !has_steward {
            let mut steward = AgentSpec::new("memory-steward", "");
            steward.role = ROLE_MEMORY_STEWARD.into();
            let mut row =
                new_agent_row(&swarm_id, &steward, MEMORY_STEWARD_PROMPT.to_string(), false);
            row.name = unique_name("memory-steward", &worker_names);
            let id = self.store.insert_swarm_agent(row).await?;
            let mut deps: Vec<DependsOn> = worker_ids
                .iter()
                .chain(supervisor_id.iter())
                .map(|wid| DependsOn {
                    agent_id: wid.clone(),
                    include: IncludeMode::Summary,
                    condition: None,
                })
                .collect();
            if let Some(ref sid) = synthesis_id {
                deps.push(DependsOn {
                    agent_id: sid.clone(),
                    include: IncludeMode::Full,
                    condition: None,
                });
            }
            self.store.set_agent_depends_on(&id, deps).await?;
        }

        if spec.auto_start {
            self.start(&swarm_id).await?;
        }
        Ok(swarm_id)
    }

    /// Transitions `pending` → `running` (CAS; double-start is a conflict)
    /// and hands the swarm to the executor.
    pub async fn start(self: &Arc<Self>, swarm_id: &str) -> Result<(), SwarmError> {
        let swarm = self
            .store
            .swarm(swarm_id)
            .await?
            .ok_or(SwarmError::NotFound("swarm"))?;
        if !self
            .store
            .swarm_status_cas(swarm_id, SwarmStatus::Pending, SwarmStatus::Running)
            .await?
        {
            return Err(SwarmError::Conflict(format!(
                "swarm is {}, not pending",
                swarm.status.as_str()
            )));
        }

        let cancel = self.shutdown.child_token();
        self.running.insert(
            swarm_id.to_string(),
            RunningSwarm {
                cancel: cancel.clone(),
            },
        );
        let ctx = ExecCtx {
            store: self.store.clone(),
            llm: self.llm.clone(),
            config: self.config.clone(),
        };
        let id = swarm_id.to_string();
        let running = self.clone();
        self.tracker.spawn(async move {
            executor::execute_swarm(ctx, &id, cancel).await;
            running.running.remove(&id);
        });
        Ok(())
    }

    /// Cancels a swarm: running agents are interrupted, pending agents become
    /// `cancelled` without running.
    pub async fn cancel(&self, swarm_id: &str) -> Result<(), SwarmError> {
        let swarm = self
            .store
            .swarm(swarm_id)
            .await?
            .ok_or(SwarmError::NotFound("swarm"))?;
        match swarm.status {
            SwarmStatus::Running => {
                if let Some(entry) = self.running.get(swarm_id) {
                    entry.cancel.cancel();
                }
                Ok(())
            }
            SwarmStatus::Pending => {
                self.store
                    .swarm_status_cas(swarm_id, SwarmStatus::Pending, SwarmStatus::Cancelled)
                    .await?;
                for agent in self.store.swarm_agents(swarm_id).await? {
                    if !agent.status.is_terminal() {
                        self.store.agent_mark_cancelled(&agent.id).await?;
                    }
                }
                Ok(())
            }
            s => Err(SwarmError::Conflict(format!(
                "swarm already {}",
                s.as_str()
            ))),
        }
    }

    /// Polls until the swarm reaches a terminal state or the timeout passes.
    pub async fn wait(
        &self,
        swarm_id: &str,
        timeout: Duration,
    ) -> Result<SwarmStatus, SwarmError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let swarm = self
                .store
                .swarm(swarm_id)
                .await?
                .ok_or(SwarmError::NotFound("swarm"))?;
            if swarm.status.is_terminal() {
                return Ok(swarm.status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SwarmError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn swarm_view(
        &self,
        swarm_id: &str,
    ) -> Result<(SwarmRow, Vec<SwarmAgentRow>), SwarmError> {
        let swarm = self
            .store
            .swarm(swarm_id)
            .await?
            .ok_or(SwarmError::NotFound("swarm"))?;
        let agents = self.store.swarm_agents(swarm_id).await?;
        Ok((swarm, agents))
    }

    /// Folds completed worker outputs into the swarm's synthesis output when
    /// no synthesis agent produced one, returning the merged document. Branch
    /// merging proper belongs to the host CLI.
    pub async fn merge(&self, swarm_id: &str) -> Result<String, SwarmError> {
        let (swarm, agents) = self.swarm_view(swarm_id).await?;
        if !swarm.status.is_terminal() {
            return Err(SwarmError::Conflict("swarm is still running".into()));
        }
        if let Some(existing) = swarm.synthesis_output {
            return Ok(existing);
        }
        let mut merged = String::new();
        for agent in agents
            .iter()
            .filter(|a| super::is_worker_role(&a.role))
            .filter(|a| a.output.is_some())
        {
            merged.push_str(&format!(
                "## {}\n\n{}\n\n",
                agent.name,
                agent.output.as_deref().unwrap_or_default()
            ));
        }
        if merged.is_empty() {
            return Err(SwarmError::Conflict("no completed worker outputs".into()));
        }
        self.store
            .set_swarm_synthesis_output(swarm_id, &merged)
            .await?;
        Ok(merged)
    }

    /// Stops every running swarm and waits for executors to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn new_agent_row(
    swarm_id: &str,
    spec: &AgentSpec,
    prompt: String,
    is_synthesis: bool,
) -> NewSwarmAgent {
    NewSwarmAgent {
        swarm_id: swarm_id.to_string(),
        name: spec.name.clone(),
        role: spec.role.clone(),
        mode: spec.mode.as_str().to_string(),
        prompt,
        is_synthesis,
        personality: spec.personality.clone(),
        plugins: spec.plugins.clone(),
        allowed_tools: spec.allowed_tools.clone(),
        model: spec.model.clone(),
        sandbox: spec.sandbox,
        timeout_secs: spec.timeout_secs.map(|t| t as i64),
        goal: spec.goal.clone(),
        capabilities: spec.capabilities.clone(),
        task_types: spec.task_types.clone(),
        max_tasks: spec.max_tasks,
        max_duration_secs: spec.max_duration_secs,
        idle_timeout_secs: spec.idle_timeout_secs,
    }
}

/// Avoids a name collision when a user agent already claimed the
/// convention node's name.
fn unique_name(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|n| n == base) {
        return base.to_string();
    }
    let mut i = 2;
    loop {
        let candidate = format!("{}-{}", base, i);
        if !taken.iter().any(|n| *n == candidate) {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    async fn orchestrator() -> (tempfile::TempDir, Store, Arc<Orchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(MockLlm::new("output")),
            SwarmConfig::default(),
        );
        (dir, store, orch)
    }

    fn two_agent_spec() -> SwarmSpec {
        SwarmSpec {
            name: "review".into(),
            working_dir: "/p".into(),
            agents: vec![
                AgentSpec::new("a", "first"),
                AgentSpec::new("b", "second").depends_on_full("a"),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_appends_memory_steward_and_resolves_deps() {
        let (_d, store, orch) = orchestrator().await;
        let id = orch.create(two_agent_spec()).await.unwrap();
        let agents = store.swarm_agents(&id).await.unwrap();
        // a, b, memory-steward.
        assert_eq!(agents.len(), 3);
        let steward = agents.iter().find(|a| a.role == ROLE_MEMORY_STEWARD).unwrap();
        assert_eq!(steward.depends_on.len(), 2);
        let b = agents.iter().find(|a| a.name == "b").unwrap();
        let a = agents.iter().find(|a| a.name == "a").unwrap();
        assert_eq!(b.depends_on[0].agent_id, a.id);
        // Assigned prompts carry the memory prefix.
        assert!(a.prompt.contains("scratchpad"));
        assert!(a.prompt.contains("first"));
    }

    #[tokio::test]
    async fn create_with_synthesis_wires_full_deps() {
        let (_d, store, orch) = orchestrator().await;
        let mut spec = two_agent_spec();
        spec.auto_synthesize = true;
        let id = orch.create(spec).await.unwrap();
        let agents = store.swarm_agents(&id).await.unwrap();
        let synthesis = agents.iter().find(|a| a.is_synthesis).unwrap();
        assert_eq!(synthesis.depends_on.len(), 2);
        assert!(synthesis
            .depends_on
            .iter()
            .all(|d| d.include == IncludeMode::Full));
        // Steward takes synthesis full, workers summary.
        let steward = agents.iter().find(|a| a.role == ROLE_MEMORY_STEWARD).unwrap();
        let full: Vec<_> = steward
            .depends_on
            .iter()
            .filter(|d| d.include == IncludeMode::Full)
            .collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].agent_id, synthesis.id);
    }

    #[tokio::test]
    async fn cycle_leaves_no_rows() {
        let (_d, store, orch) = orchestrator().await;
        let spec = SwarmSpec {
            name: "cyclic".into(),
            working_dir: "/p".into(),
            agents: vec![
                AgentSpec::new("x", "p").depends_on_full("y"),
                AgentSpec::new("y", "p").depends_on_full("x"),
            ],
            ..Default::default()
        };
        let err = orch.create(spec).await.unwrap_err();
        assert!(matches!(err, SwarmError::Cycle { .. }));
        // No swarm row persisted: stats stay empty.
        let n: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM swarms", [], |r| r.get(0))
                    .map_err(crate::store::map_sql)
            })
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn start_requires_pending() {
        let (_d, _store, orch) = orchestrator().await;
        let id = orch.create(two_agent_spec()).await.unwrap();
        orch.start(&id).await.unwrap();
        // Wait for the tiny mock swarm to finish, then a second start conflicts.
        orch.wait(&id, Duration::from_secs(5)).await.unwrap();
        let err = orch.start(&id).await.unwrap_err();
        assert!(matches!(err, SwarmError::Conflict(_)));
    }
}
