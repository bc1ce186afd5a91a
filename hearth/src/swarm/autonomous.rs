//! Autonomous agent loop: claim ready project tasks matching the agent's
//! task types, run one LLM call per task, and exit on max-tasks,
//! max-duration, idle-timeout, or swarm cancellation.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::executor::ExecCtx;
use super::SwarmError;
use crate::llm::LlmClient;
use crate::message::Message;
use crate::store::swarm::{SwarmAgentRow, SwarmRow};

const DEFAULT_MAX_TASKS: i64 = 10;
const DEFAULT_MAX_DURATION_SECS: i64 = 3600;
const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 300;
const CLAIM_POLL: Duration = Duration::from_millis(500);

/// Runs the claim loop; returns the agent's closing output text (and no
/// summary; the report is already short).
pub(crate) async fn run_loop(
    ctx: &ExecCtx,
    swarm: &SwarmRow,
    agent: &SwarmAgentRow,
    session_id: &str,
    cancel: &CancellationToken,
) -> Result<(String, Option<String>), SwarmError> {
    let max_tasks = agent.max_tasks.unwrap_or(DEFAULT_MAX_TASKS);
    let max_duration =
        Duration::from_secs(agent.max_duration_secs.unwrap_or(DEFAULT_MAX_DURATION_SECS) as u64);
    let idle_timeout =
        Duration::from_secs(agent.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS) as u64);

    let started = Instant::now();
    let mut last_progress = Instant::now();
    let mut completed: i64 = 0;
    let mut failed: i64 = 0;
    let mut exit_reason = "max tasks reached";

    loop {
        if cancel.is_cancelled() {
            return Err(SwarmError::Cancelled);
        }
        if completed + failed >= max_tasks {
            break;
        }
        if started.elapsed() >= max_duration {
            exit_reason = "max duration reached";
            break;
        }
        if last_progress.elapsed() >= idle_timeout {
            exit_reason = "idle timeout";
            break;
        }

        let task = ctx
            .store
            .claim_next_project_task(
                &swarm.working_dir,
                agent.task_types.clone(),
                &agent.name,
                Some(session_id.to_string()),
            )
            .await?;
        let Some(task) = task else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SwarmError::Cancelled),
                _ = tokio::time::sleep(CLAIM_POLL) => continue,
            }
        };
        last_progress = Instant::now();
        ctx.store
            .agent_set_current_task(&agent.id, Some(task.id.clone()))
            .await
            .ok();

        let goal = agent.goal.as_deref().unwrap_or("complete queued work");
        let messages = [
            Message::system(format!(
                "You are autonomous agent '{}' pursuing: {}. Available capabilities: {}.",
                agent.name,
                goal,
                if agent.capabilities.is_empty() {
                    "general".to_string()
                } else {
                    agent.capabilities.join(", ")
                }
            )),
            Message::user(format!(
                "Task: {}\n\n{}",
                task.title,
                if task.description.is_empty() {
                    "(no further description)"
                } else {
                    task.description.as_str()
                }
            )),
        ];

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                // Return the claim so another agent can pick it up.
                ctx.store.release_project_task(&task.id, None).await.ok();
                return Err(SwarmError::Cancelled);
            }
            r = ctx.llm.invoke(&messages) => r,
        };

        match outcome {
            Ok(response) if !response.content.trim().is_empty() => {
                ctx.store
                    .complete_project_task(
                        &task.id,
                        serde_json::json!({
                            "outcome": response.content,
                            "completed_by": agent.name,
                        }),
                    )
                    .await?;
                completed += 1;
                ctx.store
                    .agent_record_task_result(&agent.id, true, None)
                    .await?;
            }
            Ok(_) => {
                // Empty output: release for another attempt.
                ctx.store
                    .release_project_task(&task.id, Some("empty output".into()))
                    .await?;
                failed += 1;
                ctx.store
                    .agent_record_task_result(&agent.id, false, None)
                    .await?;
            }
            Err(e) => {
                ctx.store
                    .release_project_task(&task.id, Some(e.to_string()))
                    .await?;
                failed += 1;
                ctx.store
                    .agent_record_task_result(&agent.id, false, None)
                    .await?;
            }
        }
    }

    let output = format!(
        "Autonomous run finished ({}): {} tasks completed, {} failed.",
        exit_reason, completed, failed
    );
    ctx.store
        .agent_mark_completed(&agent.id, &output, None, 0)
        .await?;
    Ok((output, None))
}
