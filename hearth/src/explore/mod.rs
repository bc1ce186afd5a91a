//! Ambient exploration: expand curiosity tasks into findings with a
//! structured LLM call, persist and promote them, and seed follow-up and
//! gap tasks.

mod graph;

pub use graph::{
    FactIntegration, GraphEntity, KnowledgeGraph, NullFactIntegration, NullKnowledgeGraph,
};

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Kinded};
use crate::llm::{LlmClient, LlmError};
use crate::message::Message;
use crate::store::project_task::NewProjectTask;
use crate::store::{Store, StoreError};

/// Findings at or above this confidence are promoted to the knowledge graph.
pub const PROMOTION_CONFIDENCE: f64 = 0.7;
/// Cap on follow-up curiosity tasks spawned per exploration.
pub const MAX_FOLLOW_UPS: usize = 5;

#[derive(Debug, Error)]
pub enum ExploreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("fact integration: {0}")]
    Integration(String),
}

impl Kinded for ExploreError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExploreError::Store(e) => e.kind(),
            ExploreError::Llm(e) => e.kind(),
            ExploreError::Integration(_) => ErrorKind::Internal,
        }
    }
}

/// Structured output the exploration prompt forces.
#[derive(Clone, Debug, Deserialize)]
pub struct ExplorationReport {
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub worth_sharing: bool,
    #[serde(default)]
    pub share_message: Option<String>,
}

pub fn exploration_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "findings": { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "follow_up_questions": { "type": "array", "items": { "type": "string" } },
            "worth_sharing": { "type": "boolean" },
            "share_message": { "type": "string" }
        },
        "required": ["findings", "confidence", "follow_up_questions", "worth_sharing"]
    })
}

/// Outcome of one exploration tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExplorationOutcome {
    /// Task was not `ready` (another worker won the claim, or it is gone).
    NotClaimed,
    Completed {
        new_findings: usize,
        follow_ups: usize,
        promoted: bool,
    },
}

pub struct Explorer {
    store: Store,
    llm: Arc<dyn LlmClient>,
    facts: Arc<dyn FactIntegration>,
    graph: Arc<dyn KnowledgeGraph>,
}

impl Explorer {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmClient>,
        facts: Arc<dyn FactIntegration>,
        graph: Arc<dyn KnowledgeGraph>,
    ) -> Self {
        Self {
            store,
            llm,
            facts,
            graph,
        }
    }

    /// Runs one exploration: claim, structured LLM call, persist findings,
    /// promote, spawn follow-ups. Failures and cancellation release the task
    /// back to `ready`; the LLM call races `cancel`.
    pub async fn run_task(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExplorationOutcome, ExploreError> {
        let Some(task) = self
            .store
            .claim_project_task_by_id(task_id, "explorer", None)
            .await?
        else {
            return Ok(ExplorationOutcome::NotClaimed);
        };
        let execution = self.store.mission_started(&task.id).await?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ExploreError::Llm(LlmError::Cancelled)),
            r = self.explore(&task.title, &task.description) => r,
        };
        let report = match result {
            Ok(r) => r,
            Err(e) => {
                let msg = e.to_string();
                self.store
                    .release_project_task(&task.id, Some(msg.clone()))
                    .await?;
                self.store
                    .mission_finished(execution, false, Some(msg))
                    .await?;
                return Err(e);
            }
        };

        let mut new_findings = 0;
        for finding in &report.findings {
            if finding.trim().is_empty() {
                continue;
            }
            let inserted = self
                .store
                .insert_finding(
                    &task.id,
                    finding,
                    report.confidence,
                    report.worth_sharing,
                    report.share_message.clone(),
                )
                .await?;
            if inserted {
                new_findings += 1;
            }
        }

        let promoted = report.confidence >= PROMOTION_CONFIDENCE && !report.findings.is_empty();
        if promoted {
            self.facts
                .integrate_findings(&task.id, &report.findings, report.confidence)
                .await
                .map_err(|e| ExploreError::Integration(e.to_string()))?;
        }

        let mut follow_ups = 0;
        let mut seen = std::collections::HashSet::new();
        for question in report.follow_up_questions.iter().take(MAX_FOLLOW_UPS) {
            let title = question.trim();
            if title.is_empty() || !seen.insert(title.to_string()) {
                continue;
            }
            if self
                .store
                .project_task_title_exists(&task.working_dir, title)
                .await?
            {
                continue;
            }
            self.store
                .create_project_task(NewProjectTask {
                    working_dir: task.working_dir.clone(),
                    title: title.to_string(),
                    description: format!("Follow-up from: {}", task.title),
                    task_type: "curiosity".into(),
                    discovered_from: Some(task.id.clone()),
                    ..Default::default()
                })
                .await?;
            follow_ups += 1;
        }

        let exploration_count = task.extra["exploration_count"].as_i64().unwrap_or(0) + 1;
        self.store
            .complete_project_task(
                &task.id,
                serde_json::json!({
                    "findings": report.findings,
                    "confidence": report.confidence,
                    "exploration_count": exploration_count,
                    "last_exploration_result": if promoted { "promoted" } else { "stored" },
                }),
            )
            .await?;
        self.store
            .mission_finished(
                execution,
                true,
                Some(format!("{} findings", report.findings.len())),
            )
            .await?;

        tracing::info!(
            task = %task.id,
            new_findings,
            follow_ups,
            promoted,
            "exploration completed"
        );
        Ok(ExplorationOutcome::Completed {
            new_findings,
            follow_ups,
            promoted,
        })
    }

    async fn explore(&self, title: &str, description: &str) -> Result<ExplorationReport, ExploreError> {
        let messages = [
            Message::system(
                "You are an ambient research agent. Investigate the question using only the \
                 Read, WebSearch, and WebFetch tools. Report concrete facts, not speculation.",
            ),
            Message::user(format!(
                "Question: {}\n\nContext:\n{}",
                title,
                if description.is_empty() { "(none)" } else { description }
            )),
        ];
        let value = self
            .llm
            .invoke_structured(&messages, &exploration_schema())
            .await?;
        serde_json::from_value(value).map_err(|e| ExploreError::Llm(LlmError::Parse(e.to_string())))
    }

    /// Seeds curiosity tasks for unexplored and underexplored graph entities,
    /// deduped by entity UUID. Returns how many tasks were created.
    pub async fn spawn_gap_tasks(&self, working_dir: &str) -> Result<usize, ExploreError> {
        let mut entities = self.graph.find_unexplored_entities(10).await;
        entities.extend(self.graph.find_underexplored_entities(10).await);
        let mut created = 0;
        let mut seen = std::collections::HashSet::new();
        for entity in entities {
            if !seen.insert(entity.uuid.clone()) {
                continue;
            }
            if self.store.gap_task_exists_for_entity(&entity.uuid).await? {
                continue;
            }
            self.store
                .create_project_task(NewProjectTask {
                    working_dir: working_dir.to_string(),
                    title: format!("What is known about {}?", entity.name),
                    description: "Gap detection: this entity has little or no coverage.".into(),
                    task_type: "curiosity".into(),
                    extra: serde_json::json!({ "entity_uuid": entity.uuid }),
                    ..Default::default()
                })
                .await?;
            created += 1;
        }
        Ok(created)
    }
}
