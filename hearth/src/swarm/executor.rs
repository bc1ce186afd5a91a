//! Swarm execution: one task per agent, synchronized through watch channels
//! so an agent never starts before all of its dependencies reached a terminal
//! state. Skip rules, dependency-context assembly, timeouts, and cancellation
//! live here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::orchestrator::SwarmConfig;
use super::{autonomous, dag, is_worker_role, AgentMode, SwarmError, ROLE_MEMORY_STEWARD};
use crate::llm::LlmClient;
use crate::message::Message;
use crate::store::conversation::{Block, NewConversation};
use crate::store::session::NewSession;
use crate::store::swarm::{AgentStatus, DependsOn, IncludeMode, SwarmAgentRow, SwarmRow, SwarmStatus};
use crate::store::Store;

#[derive(Clone)]
pub(crate) struct ExecCtx {
    pub store: Store,
    pub llm: Arc<dyn LlmClient>,
    pub config: SwarmConfig,
}

/// Terminal result one agent publishes to its dependents.
#[derive(Clone, Debug)]
pub(crate) struct AgentOutcome {
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub summary: Option<String>,
}

type OutcomeTx = watch::Sender<Option<AgentOutcome>>;
type OutcomeRx = watch::Receiver<Option<AgentOutcome>>;

/// Runs every agent of a started swarm to a terminal state, then stamps the
/// swarm's terminal status.
pub(crate) async fn execute_swarm(ctx: ExecCtx, swarm_id: &str, cancel: CancellationToken) {
    let swarm = match ctx.store.swarm(swarm_id).await {
        Ok(Some(s)) => s,
        other => {
            tracing::error!(swarm_id, "cannot load swarm for execution: {:?}", other.err());
            return;
        }
    };
    let agents = match ctx.store.swarm_agents(swarm_id).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(swarm_id, "cannot load agents: {}", e);
            return;
        }
    };

    let mut senders: HashMap<String, OutcomeTx> = HashMap::new();
    let mut receivers: HashMap<String, OutcomeRx> = HashMap::new();
    for agent in &agents {
        let (tx, rx) = watch::channel(None);
        senders.insert(agent.id.clone(), tx);
        receivers.insert(agent.id.clone(), rx);
    }

    let swarm = Arc::new(swarm);
    let mut set = tokio::task::JoinSet::new();
    for agent in agents {
        let deps: Vec<(DependsOn, OutcomeRx)> = agent
            .depends_on
            .iter()
            .filter_map(|d| receivers.get(&d.agent_id).map(|rx| (d.clone(), rx.clone())))
            .collect();
        let Some(tx) = senders.remove(&agent.id) else {
            continue;
        };
        let ctx = ctx.clone();
        let swarm = swarm.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let outcome = run_agent(&ctx, &swarm, &agent, deps, cancel).await;
            let _ = tx.send(Some(outcome));
        });
    }
    while set.join_next().await.is_some() {}

    let final_status = match ctx.store.swarm_agents(swarm_id).await {
        Ok(done) => {
            let workers: Vec<&SwarmAgentRow> = done
                .iter()
                .filter(|a| is_worker_role(&a.role))
                .collect();
            if cancel.is_cancelled() {
                SwarmStatus::Cancelled
            } else if workers.iter().any(|a| a.status == AgentStatus::Completed) {
                SwarmStatus::Completed
            } else {
                SwarmStatus::Failed
            }
        }
        Err(_) => SwarmStatus::Failed,
    };
    match ctx
        .store
        .swarm_status_cas(swarm_id, SwarmStatus::Running, final_status)
        .await
    {
        Ok(true) => tracing::info!(swarm_id, status = final_status.as_str(), "swarm finished"),
        Ok(false) => {}
        Err(e) => tracing::error!(swarm_id, "cannot stamp swarm status: {}", e),
    }
}

async fn run_agent(
    ctx: &ExecCtx,
    swarm: &SwarmRow,
    agent: &SwarmAgentRow,
    deps: Vec<(DependsOn, OutcomeRx)>,
    cancel: CancellationToken,
) -> AgentOutcome {
    match run_agent_inner(ctx, swarm, agent, deps, &cancel).await {
        Ok(outcome) => outcome,
        Err(SwarmError::Cancelled) => {
            let _ = ctx.store.agent_mark_cancelled(&agent.id).await;
            terminal(agent, AgentStatus::Cancelled, None, None)
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(agent = %agent.name, "agent failed: {}", message);
            let _ = ctx.store.agent_mark_failed(&agent.id, &message).await;
            terminal(agent, AgentStatus::Failed, None, None)
        }
    }
}

fn terminal(
    agent: &SwarmAgentRow,
    status: AgentStatus,
    output: Option<String>,
    summary: Option<String>,
) -> AgentOutcome {
    AgentOutcome {
        name: agent.name.clone(),
        role: agent.role.clone(),
        status,
        output,
        summary,
    }
}

async fn run_agent_inner(
    ctx: &ExecCtx,
    swarm: &SwarmRow,
    agent: &SwarmAgentRow,
    deps: Vec<(DependsOn, OutcomeRx)>,
    cancel: &CancellationToken,
) -> Result<AgentOutcome, SwarmError> {
    // Gate on every dependency reaching a terminal state.
    let mut resolved: Vec<(DependsOn, AgentOutcome)> = Vec::with_capacity(deps.len());
    for (edge, mut rx) in deps {
        // A dropped sender (aborted executor) counts as a failed dependency.
        let missing = || AgentOutcome {
            name: edge.agent_id.clone(),
            role: String::new(),
            status: AgentStatus::Failed,
            output: None,
            summary: None,
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SwarmError::Cancelled),
            r = rx.wait_for(|v| v.is_some()) => match r {
                Ok(guard) => guard.clone().unwrap_or_else(missing),
                Err(_) => missing(),
            },
        };
        resolved.push((edge, outcome));
    }
    if cancel.is_cancelled() {
        return Err(SwarmError::Cancelled);
    }

    // Skip rules. The memory steward always runs; it records what happened.
    if agent.role != ROLE_MEMORY_STEWARD {
        for (edge, dep) in &resolved {
            if edge.condition.is_none() && dep.status == AgentStatus::Failed {
                let reason = format!("Dependency {} failed", dep.name);
                ctx.store.agent_mark_skipped(&agent.id, &reason).await?;
                return Ok(terminal(agent, AgentStatus::Skipped, None, None));
            }
        }
        for (edge, dep) in &resolved {
            if let Some(condition) = &edge.condition {
                let output = dep.output.as_deref().unwrap_or("");
                if !dag::eval_condition(condition, output) {
                    let reason = format!(
                        "Condition not met on {}: {}",
                        dep.name, condition
                    );
                    ctx.store.agent_mark_skipped(&agent.id, &reason).await?;
                    return Ok(terminal(agent, AgentStatus::Skipped, None, None));
                }
            }
        }
        if agent.is_synthesis && swarm.skip_synthesis_on_failure {
            let failed_worker = resolved
                .iter()
                .find(|(_, d)| is_worker_role(&d.role) && d.status == AgentStatus::Failed);
            if let Some((_, dep)) = failed_worker {
                let reason = format!("Worker {} failed; synthesis skipped", dep.name);
                ctx.store.agent_mark_skipped(&agent.id, &reason).await?;
                return Ok(terminal(agent, AgentStatus::Skipped, None, None));
            }
        }
    }

    let dependency_context = build_dependency_context(&resolved);

    // Each agent runs in its own child session, closed no matter the outcome.
    let session_id = ctx
        .store
        .create_session(NewSession {
            working_dir: swarm.working_dir.clone(),
            personalities: agent.personality.iter().cloned().collect(),
            medium: "swarm".into(),
            swarm_id: Some(swarm.id.clone()),
            swarm_agent_id: Some(agent.id.clone()),
            ..Default::default()
        })
        .await?;
    ctx.store.agent_mark_running(&agent.id, &session_id).await?;

    let result = match AgentMode::from_str(&agent.mode) {
        AgentMode::Assigned => {
            run_assigned(ctx, swarm, agent, &session_id, &dependency_context, cancel).await
        }
        AgentMode::Autonomous => {
            autonomous::run_loop(ctx, swarm, agent, &session_id, cancel).await
        }
    };
    let _ = ctx.store.end_session(&session_id).await;

    match result {
        Ok((output, summary)) => {
            if agent.is_synthesis {
                ctx.store
                    .set_swarm_synthesis_output(&swarm.id, &output)
                    .await?;
            }
            Ok(terminal(
                agent,
                AgentStatus::Completed,
                Some(output),
                summary,
            ))
        }
        Err(e) => Err(e),
    }
}

impl AgentMode {
    fn from_str(s: &str) -> Self {
        if s == "autonomous" {
            AgentMode::Autonomous
        } else {
            AgentMode::Assigned
        }
    }
}

fn build_dependency_context(resolved: &[(DependsOn, AgentOutcome)]) -> String {
    let mut sections = Vec::new();
    for (edge, dep) in resolved {
        if dep.status != AgentStatus::Completed {
            continue;
        }
        let body = match edge.include {
            IncludeMode::Full => dep.output.clone(),
            IncludeMode::Summary => dep.summary.clone().or_else(|| dep.output.clone()),
            IncludeMode::None => None,
        };
        if let Some(body) = body {
            sections.push(format!("## Output from {}\n\n{}", dep.name, body));
        }
    }
    sections.join("\n\n")
}

async fn run_assigned(
    ctx: &ExecCtx,
    swarm: &SwarmRow,
    agent: &SwarmAgentRow,
    session_id: &str,
    dependency_context: &str,
    cancel: &CancellationToken,
) -> Result<(String, Option<String>), SwarmError> {
    let composed = if dependency_context.is_empty() {
        agent.prompt.clone()
    } else {
        format!("{}\n\n---\n\n{}", dependency_context, agent.prompt)
    };
    ctx.store
        .store_conversation(NewConversation {
            session_id: session_id.to_string(),
            prompt: composed.clone(),
            message_type: "user",
            personality: agent.personality.clone().unwrap_or_default(),
            medium: "swarm".into(),
            ..Default::default()
        })
        .await?;

    let system = format!(
        "You are agent '{}' (role: {}) in the swarm '{}'. Working directory: {}. \
         Produce your complete result; dependents receive it verbatim.",
        agent.name, agent.role, swarm.name, swarm.working_dir
    );
    let messages = [Message::system(system), Message::user(composed)];

    let timeout_secs = agent
        .timeout_secs
        .map(|t| t as u64)
        .unwrap_or(ctx.config.default_agent_timeout_secs);
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(SwarmError::Cancelled),
        r = tokio::time::timeout(Duration::from_secs(timeout_secs), ctx.llm.invoke(&messages)) => {
            match r {
                Err(_) => return Err(SwarmError::Timeout(timeout_secs)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(resp)) => resp,
            }
        }
    };

    let output = response.content;
    let assistant_id = ctx
        .store
        .store_conversation(NewConversation {
            session_id: session_id.to_string(),
            prompt: output.clone(),
            message_type: "assistant",
            medium: "swarm".into(),
            ..Default::default()
        })
        .await?;
    ctx.store
        .append_blocks(assistant_id, vec![Block::Text(output.clone())])
        .await?;

    let summary = summarize_if_long(ctx, &output).await;
    ctx.store
        .agent_mark_completed(&agent.id, &output, summary.clone(), 0)
        .await?;
    Ok((output, summary))
}

/// Computes the `summary` include-mode text when the output is over the
/// threshold; LLM failure degrades to truncation.
pub(crate) async fn summarize_if_long(ctx: &ExecCtx, output: &str) -> Option<String> {
    if output.chars().count() <= ctx.config.summary_threshold {
        return None;
    }
    let messages = [
        Message::system("Condense the following agent output to its essential facts and decisions, in under 200 words."),
        Message::user(output.to_string()),
    ];
    match ctx.llm.invoke(&messages).await {
        Ok(r) if !r.content.is_empty() => Some(r.content),
        _ => {
            let truncated: String = output.chars().take(ctx.config.summary_threshold).collect();
            Some(format!("{}…", truncated))
        }
    }
}
