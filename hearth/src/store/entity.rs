//! Entities extracted from conversations, their relations, and citation
//! records written by the gateway after each reply.

use rusqlite::{params, OptionalExtension};

use super::{map_sql, now_millis, Store, StoreError};

#[derive(Clone, Debug)]
pub struct EntityRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub mention_count: i64,
    pub last_seen: i64,
}

impl Store {
    /// Inserts the entity or bumps its mention count. Returns the entity id.
    pub async fn upsert_entity(
        &self,
        name: &str,
        kind: &str,
        session_id: Option<String>,
    ) -> Result<i64, StoreError> {
        let name = name.to_string();
        let kind = kind.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entities (name, kind, session_id, mention_count, last_seen) \
                 VALUES (?1, ?2, ?3, 1, ?4) \
                 ON CONFLICT(name, kind) DO UPDATE SET \
                 mention_count = mention_count + 1, last_seen = excluded.last_seen",
                params![name, kind, session_id, now_millis()],
            )
            .map_err(map_sql)?;
            conn.query_row(
                "SELECT id FROM entities WHERE name = ?1 AND kind = ?2",
                params![name, kind],
                |r| r.get(0),
            )
            .map_err(map_sql)
        })
        .await
    }

    pub async fn add_entity_relation(
        &self,
        from_id: i64,
        to_id: i64,
        relation: &str,
    ) -> Result<(), StoreError> {
        let relation = relation.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entity_relations (from_id, to_id, relation) VALUES (?1, ?2, ?3)",
                params![from_id, to_id, relation],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Top entities for one session by mention count.
    pub async fn top_entities_for_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, kind, mention_count, last_seen FROM entities \
                     WHERE session_id = ?1 ORDER BY mention_count DESC, last_seen DESC LIMIT ?2",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![session_id, limit as i64], |r| {
                    Ok(EntityRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        kind: r.get(2)?,
                        mention_count: r.get(3)?,
                        last_seen: r.get(4)?,
                    })
                })
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    pub async fn entity_by_name(&self, name: &str) -> Result<Option<EntityRow>, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, kind, mention_count, last_seen FROM entities WHERE name = ?1 \
                 ORDER BY mention_count DESC LIMIT 1",
                params![name],
                |r| {
                    Ok(EntityRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        kind: r.get(2)?,
                        mention_count: r.get(3)?,
                        last_seen: r.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(map_sql)
        })
        .await
    }

    pub async fn record_entity_citation(
        &self,
        entity_id: i64,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entity_citations (entity_id, session_id, cited_at) VALUES (?1, ?2, ?3)",
                params![entity_id, session_id, now_millis()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    pub async fn citation_count(&self, entity_id: i64) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM entity_citations WHERE entity_id = ?1",
                params![entity_id],
                |r| r.get(0),
            )
            .map_err(map_sql)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_bumps_mention_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let a = store.upsert_entity("tokio", "library", None).await.unwrap();
        let b = store.upsert_entity("tokio", "library", None).await.unwrap();
        assert_eq!(a, b);
        let row = store.entity_by_name("tokio").await.unwrap().unwrap();
        assert_eq!(row.mention_count, 2);
    }

    #[tokio::test]
    async fn citations_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), 4).unwrap();
        let id = store.upsert_entity("axum", "library", None).await.unwrap();
        store.record_entity_citation(id, "s1").await.unwrap();
        store.record_entity_citation(id, "s2").await.unwrap();
        assert_eq!(store.citation_count(id).await.unwrap(), 2);
    }
}
