//! Most-recently-built context document per session, with freshness metadata.
//! Writes are idempotent overwrites; readers filter by age.

use rusqlite::{params, OptionalExtension};

use super::{map_sql, now_millis, Store, StoreError};

/// One cached context document.
#[derive(Clone, Debug)]
pub struct ContextCacheEntry {
    pub session_id: String,
    pub context: String,
    /// Section names and entity names that fed the document.
    pub sources: Vec<String>,
    pub token_estimate: i64,
    pub built_at: i64,
}

impl Store {
    pub async fn write_context_cache(
        &self,
        session_id: &str,
        context: &str,
        sources: Vec<String>,
        token_estimate: i64,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let context = context.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO context_cache (session_id, context, sources, token_estimate, built_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(session_id) DO UPDATE SET context = excluded.context, \
                 sources = excluded.sources, token_estimate = excluded.token_estimate, \
                 built_at = excluded.built_at",
                params![
                    session_id,
                    context,
                    serde_json::to_string(&sources)?,
                    token_estimate,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Reads the cache entry if it is no older than `max_age_minutes`.
    pub async fn read_context_cache(
        &self,
        session_id: &str,
        max_age_minutes: i64,
    ) -> Result<Option<ContextCacheEntry>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let cutoff = now_millis() - max_age_minutes * 60_000;
            conn.query_row(
                "SELECT session_id, context, sources, token_estimate, built_at \
                 FROM context_cache WHERE session_id = ?1 AND built_at >= ?2",
                params![session_id, cutoff],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sql)?
            .map(|(session_id, context, sources, token_estimate, built_at)| {
                Ok(ContextCacheEntry {
                    session_id,
                    context,
                    sources: serde_json::from_str(&sources)?,
                    token_estimate,
                    built_at,
                })
            })
            .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_overwrites_and_age_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();

        store
            .write_context_cache("s1", "<context>v1</context>", vec!["recent".into()], 10)
            .await
            .unwrap();
        store
            .write_context_cache("s1", "<context>v2</context>", vec!["recent".into()], 12)
            .await
            .unwrap();

        let entry = store.read_context_cache("s1", 5).await.unwrap().unwrap();
        assert_eq!(entry.context, "<context>v2</context>");
        assert_eq!(entry.sources, vec!["recent".to_string()]);

        // An entry older than the freshness bound is treated as absent.
        let stale = store.read_context_cache("s1", 0).await.unwrap();
        assert!(stale.is_none() || stale.unwrap().built_at >= super::now_millis() - 1000);
        assert!(store.read_context_cache("other", 5).await.unwrap().is_none());
    }
}
