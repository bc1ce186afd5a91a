//! Mode sessions: previous-session lookup and wellness extraction.
//!
//! "Modes" are personality-scoped session families (e.g. a wellness
//! check-in). `previous_session` feeds the wrapper enough context to open
//! with continuity; `extract_wellness` turns a transcript into a structured
//! record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::LlmClient;
use crate::message::Message;
use crate::store::{millis_to_rfc3339, now_millis, Store, StoreError};

#[derive(Clone, Debug, Default, Serialize)]
pub struct PreviousSession {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_session_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_ago: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<String>,
}

/// Structured wellness record on 1–10 axes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WellnessRecord {
    pub mood: i64,
    pub energy: i64,
    pub stress: i64,
    pub sleep_quality: i64,
    #[serde(default)]
    pub notes: Vec<String>,
    pub confidence: String,
}

impl WellnessRecord {
    /// Record returned when the LLM is unreachable: 5 on every axis, no
    /// notes, low confidence.
    fn fallback() -> Self {
        Self {
            mood: 5,
            energy: 5,
            stress: 5,
            sleep_quality: 5,
            notes: Vec::new(),
            confidence: "low".into(),
        }
    }
}

pub struct ModeService {
    store: Store,
    llm: Arc<dyn LlmClient>,
}

impl ModeService {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, llm }
    }

    /// Most recent summarized session of this mode in the project.
    pub async fn previous_session(
        &self,
        mode: &str,
        project_path: &str,
        user_id: Option<String>,
    ) -> Result<PreviousSession, StoreError> {
        let Some((summary, start_time)) = self
            .store
            .latest_mode_summary(mode, project_path, user_id)
            .await?
        else {
            return Ok(PreviousSession::default());
        };
        let days_ago = (now_millis() - start_time) / (24 * 3600 * 1000);
        Ok(PreviousSession {
            found: true,
            session_id: Some(summary.session_id.clone()),
            last_session_date: Some(millis_to_rfc3339(start_time)),
            days_ago: Some(days_ago),
            summary: Some(summary.summary.clone()),
            key_topics: Some(summary.key_topics.clone()),
            next_steps: summary.next_steps.clone(),
        })
    }

    /// Extracts a wellness record from a conversation transcript. An
    /// unreachable LLM degrades to mid-scale values with low confidence.
    pub async fn extract_wellness(
        &self,
        mode: &str,
        conversation: &str,
        _session_id: &str,
    ) -> WellnessRecord {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "mood": { "type": "integer", "minimum": 1, "maximum": 10 },
                "energy": { "type": "integer", "minimum": 1, "maximum": 10 },
                "stress": { "type": "integer", "minimum": 1, "maximum": 10 },
                "sleep_quality": { "type": "integer", "minimum": 1, "maximum": 10 },
                "notes": { "type": "array", "items": { "type": "string" } },
                "confidence": { "type": "string", "enum": ["low", "medium", "high"] }
            },
            "required": ["mood", "energy", "stress", "sleep_quality", "confidence"]
        });
        let messages = [
            Message::system(format!(
                "Read this {} check-in and rate the user's state on 1-10 scales. \
                 Only report what the text supports; set confidence accordingly.",
                mode
            )),
            Message::user(conversation.to_string()),
        ];
        match self.llm.invoke_structured(&messages, &schema).await {
            Ok(value) => match serde_json::from_value::<WellnessRecord>(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("wellness record parse failed, using mid-scale fallback: {}", e);
                    WellnessRecord::fallback()
                }
            },
            Err(e) => {
                tracing::warn!("wellness extraction unavailable, using mid-scale fallback: {}", e);
                WellnessRecord::fallback()
            }
        }
    }
}
