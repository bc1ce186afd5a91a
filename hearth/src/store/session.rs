//! Session rows: create / ensure / end, project-type detection, and the
//! related-session scoring used by the context builder.

use rusqlite::{params, Connection, OptionalExtension};

use super::{map_sql, now_millis, Store, StoreError};

/// One session row.
#[derive(Clone, Debug)]
pub struct SessionRow {
    pub id: String,
    pub working_dir: String,
    pub project_type: Option<String>,
    pub personality: String,
    pub medium: String,
    pub user_id: Option<String>,
    pub continued_from: Option<String>,
    pub swarm_id: Option<String>,
    pub swarm_agent_id: Option<String>,
    pub locked: bool,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

/// Parameters for [`Store::create_session`].
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    /// Caller-chosen id; a v4 UUID is generated when empty.
    pub id: Option<String>,
    pub working_dir: String,
    pub personalities: Vec<String>,
    pub mcp_servers: Vec<String>,
    pub medium: String,
    pub user_id: Option<String>,
    pub continued_from: Option<String>,
    pub swarm_id: Option<String>,
    pub swarm_agent_id: Option<String>,
    pub locked: bool,
}

/// A related session with its score, for context assembly.
#[derive(Clone, Debug)]
pub struct RelatedSession {
    pub session: SessionRow,
    pub score: i64,
}

/// Manifest filename → project-type tag. Unknown directories yield `None`;
/// non-filesystem working dirs simply never match.
const PROJECT_MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("go.mod", "go"),
    ("pyproject.toml", "python"),
    ("setup.py", "python"),
    ("pom.xml", "java"),
    ("Gemfile", "ruby"),
    ("mix.exs", "elixir"),
];

pub fn detect_project_type(working_dir: &str) -> Option<String> {
    let dir = std::path::Path::new(working_dir);
    for (manifest, tag) in PROJECT_MANIFESTS {
        if dir.join(manifest).is_file() {
            return Some((*tag).to_string());
        }
    }
    None
}

fn row_to_session(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        working_dir: r.get(1)?,
        project_type: r.get(2)?,
        personality: r.get(3)?,
        medium: r.get(4)?,
        user_id: r.get(5)?,
        continued_from: r.get(6)?,
        swarm_id: r.get(7)?,
        swarm_agent_id: r.get(8)?,
        locked: r.get::<_, i64>(9)? != 0,
        start_time: r.get(10)?,
        end_time: r.get(11)?,
    })
}

const SESSION_COLUMNS: &str = "id, working_dir, project_type, personality, medium, user_id, \
     continued_from, swarm_id, swarm_agent_id, locked, start_time, end_time";

impl Store {
    /// Inserts a session and its personality / MCP association rows in one
    /// transaction. Returns the session id.
    pub async fn create_session(&self, new: NewSession) -> Result<String, StoreError> {
        let id = new
            .id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let project_type = detect_project_type(&new.working_dir);
        let ret_id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_sql)?;
            tx.execute(
                "INSERT INTO sessions (id, working_dir, project_type, personality, medium, \
                 user_id, continued_from, swarm_id, swarm_agent_id, locked, start_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    new.working_dir,
                    project_type,
                    new.personalities.first().map(String::as_str).unwrap_or("default"),
                    if new.medium.is_empty() { "cli" } else { new.medium.as_str() },
                    new.user_id,
                    new.continued_from,
                    new.swarm_id,
                    new.swarm_agent_id,
                    new.locked as i64,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            for p in &new.personalities {
                tx.execute(
                    "INSERT INTO session_personalities (session_id, personality) VALUES (?1, ?2)",
                    params![id, p],
                )
                .map_err(map_sql)?;
            }
            for s in &new.mcp_servers {
                tx.execute(
                    "INSERT INTO session_mcp_servers (session_id, server) VALUES (?1, ?2)",
                    params![id, s],
                )
                .map_err(map_sql)?;
            }
            tx.commit().map_err(map_sql)
        })
        .await?;
        Ok(ret_id)
    }

    /// Inserts the session if missing; used when a wrapper supplies a
    /// pre-chosen id on `conversation.capture`.
    pub async fn ensure_session(
        &self,
        id: &str,
        working_dir: &str,
        personality: &str,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let working_dir = working_dir.to_string();
        let personality = personality.to_string();
        let project_type = detect_project_type(&working_dir);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, working_dir, project_type, personality, start_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, working_dir, project_type, personality, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Stamps `end_time`; idempotent. Returns whether this call ended it.
    pub async fn end_session(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE sessions SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
                    params![now_millis(), id],
                )
                .map_err(map_sql)?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn session(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    /// Sessions related to the given one, scored: same working directory +3,
    /// started within 24 h +2 (else within a week +1), continuation chain in
    /// either direction +5. Ordered by score then recency.
    pub async fn related_sessions(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedSession>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let target = conn
                .query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                    params![session_id],
                    row_to_session,
                )
                .optional()
                .map_err(map_sql)?
                .ok_or(StoreError::NotFound("session"))?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions WHERE id != ?1 ORDER BY start_time DESC LIMIT 200",
                    SESSION_COLUMNS
                ))
                .map_err(map_sql)?;
            let candidates: Vec<SessionRow> = stmt
                .query_map(params![target.id], row_to_session)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;

            let mut scored: Vec<RelatedSession> = candidates
                .into_iter()
                .map(|s| {
                    let score = score_related(&target, &s);
                    RelatedSession { session: s, score }
                })
                .filter(|r| r.score > 0)
                .collect();
            scored.sort_by(|a, b| {
                b.score
                    .cmp(&a.score)
                    .then(b.session.start_time.cmp(&a.session.start_time))
            });
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    /// Distinct personalities ever used, for the REST listing.
    pub async fn known_personalities(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT personality FROM session_personalities \
                     UNION SELECT DISTINCT personality FROM sessions ORDER BY 1",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    /// Most recent sessions for a working directory, newest first.
    pub async fn sessions_for_project(
        &self,
        working_dir: &str,
        limit: usize,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let working_dir = working_dir.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions WHERE working_dir = ?1 ORDER BY start_time DESC LIMIT ?2",
                    SESSION_COLUMNS
                ))
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![working_dir, limit as i64], row_to_session)
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }
}

fn score_related(target: &SessionRow, candidate: &SessionRow) -> i64 {
    let mut score = 0;
    if candidate.working_dir == target.working_dir {
        score += 3;
    }
    let dt = (target.start_time - candidate.start_time).abs();
    if dt <= 24 * 3600 * 1000 {
        score += 2;
    } else if dt <= 7 * 24 * 3600 * 1000 {
        score += 1;
    }
    let chained = target.continued_from.as_deref() == Some(candidate.id.as_str())
        || candidate.continued_from.as_deref() == Some(target.id.as_str());
    if chained {
        score += 5;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_and_end_session() {
        let (_dir, store) = test_store().await;
        let id = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                personalities: vec!["tsun".into()],
                medium: "cli".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let row = store.session(&id).await.unwrap().unwrap();
        assert_eq!(row.personality, "tsun");
        assert!(row.end_time.is_none());

        assert!(store.end_session(&id).await.unwrap());
        // Idempotent: second end is a no-op.
        assert!(!store.end_session(&id).await.unwrap());
        let row = store.session(&id).await.unwrap().unwrap();
        assert!(row.end_time.is_some());
    }

    #[tokio::test]
    async fn ensure_session_inserts_once() {
        let (_dir, store) = test_store().await;
        store.ensure_session("42", "/p", "tsun").await.unwrap();
        store.ensure_session("42", "/elsewhere", "kuu").await.unwrap();
        let row = store.session("42").await.unwrap().unwrap();
        // First insert wins; the second is ignored.
        assert_eq!(row.working_dir, "/p");
        assert_eq!(row.personality, "tsun");
    }

    #[tokio::test]
    async fn project_type_detected_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(
            detect_project_type(dir.path().to_str().unwrap()),
            Some("rust".to_string())
        );
        assert_eq!(detect_project_type("discord://guild/123"), None);
    }

    #[tokio::test]
    async fn related_sessions_scoring_and_order() {
        let (_dir, store) = test_store().await;
        let a = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        // Same dir + same day: score 5.
        let b = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        // Different dir, same day, continuation: score 2 + 5 = 7.
        let c = store
            .create_session(NewSession {
                working_dir: "/q".into(),
                continued_from: Some(a.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let related = store.related_sessions(&a, 10).await.unwrap();
        let ids: Vec<&str> = related.iter().map(|r| r.session.id.as_str()).collect();
        assert_eq!(ids, vec![c.as_str(), b.as_str()]);
        assert_eq!(related[0].score, 7);
        assert_eq!(related[1].score, 5);
    }

    #[tokio::test]
    async fn related_sessions_unknown_session_is_not_found() {
        let (_dir, store) = test_store().await;
        let err = store.related_sessions("nope", 5).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
