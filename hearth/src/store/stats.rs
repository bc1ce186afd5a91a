//! Aggregate statistics for `status.get`.

use rusqlite::params;
use serde::Serialize;

use super::{map_sql, now_millis, Store, StoreError};

#[derive(Clone, Debug, Default, Serialize)]
pub struct StorageStats {
    pub sessions_total: i64,
    pub sessions_active: i64,
    pub conversations_total: i64,
    pub avg_response_ms: Option<f64>,
    /// (personality, session count), most used first.
    pub top_personalities: Vec<(String, i64)>,
    /// (YYYY-MM-DD, conversation count) for the last 14 days, oldest first.
    pub activity_by_day: Vec<(String, i64)>,
}

impl Store {
    pub async fn storage_stats(&self) -> Result<StorageStats, StoreError> {
        self.with_conn(move |conn| {
            let sessions_total: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
                .map_err(map_sql)?;
            let sessions_active: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sessions WHERE end_time IS NULL",
                    [],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            let conversations_total: i64 = conn
                .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
                .map_err(map_sql)?;
            let avg_response_ms: Option<f64> = conn
                .query_row(
                    "SELECT AVG(response_ms) FROM conversations WHERE response_ms IS NOT NULL",
                    [],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;

            let mut stmt = conn
                .prepare(
                    "SELECT personality, COUNT(*) AS n FROM sessions \
                     GROUP BY personality ORDER BY n DESC LIMIT 5",
                )
                .map_err(map_sql)?;
            let top_personalities: Vec<(String, i64)> = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;

            let cutoff = now_millis() - 14 * 24 * 3600 * 1000;
            let mut stmt = conn
                .prepare(
                    "SELECT date(created_at / 1000, 'unixepoch') AS day, COUNT(*) \
                     FROM conversations WHERE created_at >= ?1 \
                     GROUP BY day ORDER BY day ASC",
                )
                .map_err(map_sql)?;
            let activity_by_day: Vec<(String, i64)> = stmt
                .query_map(params![cutoff], |r| Ok((r.get(0)?, r.get(1)?)))
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;

            Ok(StorageStats {
                sessions_total,
                sessions_active,
                conversations_total,
                avg_response_ms,
                top_personalities,
                activity_by_day,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conversation::NewConversation;
    use crate::store::session::NewSession;

    #[tokio::test]
    async fn stats_reflect_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                personalities: vec!["tsun".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_conversation(NewConversation {
                session_id: sid.clone(),
                prompt: "hello".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = store.storage_stats().await.unwrap();
        assert_eq!(stats.sessions_total, 1);
        assert_eq!(stats.sessions_active, 1);
        assert_eq!(stats.conversations_total, 1);
        assert_eq!(stats.top_personalities[0].0, "tsun");
        assert_eq!(stats.activity_by_day.len(), 1);

        store.end_session(&sid).await.unwrap();
        let stats = store.storage_stats().await.unwrap();
        assert_eq!(stats.sessions_active, 0);
    }
}
