//! Session summaries, one row per session-ending (or periodic/wellness) event.

use rusqlite::{params, OptionalExtension};

use super::{map_sql, now_millis, Store, StoreError};

#[derive(Clone, Debug, Default)]
pub struct NewSummary {
    pub session_id: String,
    /// `exit`, `periodic`, `wellness`, ...
    pub summary_type: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub key_entities: Vec<i64>,
    pub task_status: Option<String>,
    pub next_steps: Option<String>,
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct SummaryRow {
    pub id: i64,
    pub session_id: String,
    pub summary_type: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub next_steps: Option<String>,
    pub created_at: i64,
}

fn parse_topics(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl Store {
    pub async fn insert_summary(&self, new: NewSummary) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO session_summaries (session_id, summary_type, summary, key_topics, \
                 key_entities, task_status, next_steps, model, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.session_id,
                    new.summary_type,
                    new.summary,
                    serde_json::to_string(&new.key_topics)?,
                    serde_json::to_string(&new.key_entities)?,
                    new.task_status,
                    new.next_steps,
                    new.model,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Recent summaries for context, optionally restricted to one project and
    /// excluding the current session.
    pub async fn recent_summaries(
        &self,
        limit: usize,
        project: Option<String>,
        exclude_session: Option<String>,
    ) -> Result<Vec<SummaryRow>, StoreError> {
        self.with_conn(move |conn| {
            let sql = "SELECT ss.id, ss.session_id, ss.summary_type, ss.summary, ss.key_topics, \
                 ss.next_steps, ss.created_at \
                 FROM session_summaries ss JOIN sessions s ON s.id = ss.session_id \
                 WHERE (?1 IS NULL OR s.working_dir = ?1) AND (?2 IS NULL OR ss.session_id != ?2) \
                 ORDER BY ss.created_at DESC LIMIT ?3";
            let mut stmt = conn.prepare(sql).map_err(map_sql)?;
            let rows = stmt
                .query_map(params![project, exclude_session, limit as i64], |r| {
                    Ok(SummaryRow {
                        id: r.get(0)?,
                        session_id: r.get(1)?,
                        summary_type: r.get(2)?,
                        summary: r.get(3)?,
                        key_topics: parse_topics(&r.get::<_, String>(4)?),
                        next_steps: r.get(5)?,
                        created_at: r.get(6)?,
                    })
                })
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    /// Whether a summary of the given type already exists for the session.
    pub async fn has_summary(
        &self,
        session_id: &str,
        summary_type: &str,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        let summary_type = summary_type.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM session_summaries WHERE session_id = ?1 AND summary_type = ?2",
                    params![session_id, summary_type],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    /// Latest summary of the most recent ended session with the given
    /// personality (mode) and project, for `mode.session.previous`.
    pub async fn latest_mode_summary(
        &self,
        mode: &str,
        project: &str,
        user_id: Option<String>,
    ) -> Result<Option<(SummaryRow, i64)>, StoreError> {
        let mode = mode.to_string();
        let project = project.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT ss.id, ss.session_id, ss.summary_type, ss.summary, ss.key_topics, \
                 ss.next_steps, ss.created_at, s.start_time \
                 FROM session_summaries ss JOIN sessions s ON s.id = ss.session_id \
                 WHERE s.personality = ?1 AND s.working_dir = ?2 \
                   AND (?3 IS NULL OR s.user_id = ?3) \
                 ORDER BY ss.created_at DESC LIMIT 1",
                params![mode, project, user_id],
                |r| {
                    Ok((
                        SummaryRow {
                            id: r.get(0)?,
                            session_id: r.get(1)?,
                            summary_type: r.get(2)?,
                            summary: r.get(3)?,
                            key_topics: parse_topics(&r.get::<_, String>(4)?),
                            next_steps: r.get(5)?,
                            created_at: r.get(6)?,
                        },
                        r.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session::NewSession;

    #[tokio::test]
    async fn insert_and_filter_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let other = store
            .create_session(NewSession {
                working_dir: "/q".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        for (s, text) in [(&sid, "first"), (&other, "second")] {
            store
                .insert_summary(NewSummary {
                    session_id: s.clone(),
                    summary_type: "exit".into(),
                    summary: text.into(),
                    key_topics: vec!["t".into()],
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let all = store.recent_summaries(10, None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let scoped = store
            .recent_summaries(10, Some("/p".into()), None)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].summary, "first");

        let excluded = store
            .recent_summaries(10, None, Some(sid.clone()))
            .await
            .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].session_id, other);

        assert!(store.has_summary(&sid, "exit").await.unwrap());
        assert!(!store.has_summary(&sid, "wellness").await.unwrap());
    }
}
