//! Cosine-similarity search over conversation embeddings.
//!
//! Prefers the vec0 KNN index; degrades to an exact scan over the stored
//! blobs when the index is unavailable. Both paths return `1 - distance`
//! similarity and skip conversations without an embedding.

use rusqlite::{params, Connection};

use super::{
    blob_to_embedding, cosine_similarity, map_sql, vector_to_json, Store, StoreError, VEC_TABLE,
};

/// One similarity hit.
#[derive(Clone, Debug)]
pub struct SimilarHit {
    pub conversation_id: i64,
    pub session_id: String,
    pub prompt: String,
    pub similarity: f32,
    pub created_at: i64,
}

/// Exclusion filters for similarity search.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    pub exclude_session: Option<String>,
    pub exclude_conversation: Option<i64>,
    /// Restrict hits to sessions with this working directory.
    pub working_dir: Option<String>,
}

impl Store {
    /// Top-`limit` conversations by cosine similarity to `embedding`.
    pub async fn search_similar(
        &self,
        embedding: Vec<f32>,
        limit: usize,
        filter: SearchFilter,
    ) -> Result<Vec<SimilarHit>, StoreError> {
        if embedding.len() != self.embed_dim() {
            return Err(StoreError::InvalidData(format!(
                "query dimension {} != expected {}",
                embedding.len(),
                self.embed_dim()
            )));
        }
        let use_index = self.vec_index_available();
        self.with_conn(move |conn| {
            if use_index {
                knn_search(conn, &embedding, limit, &filter)
            } else {
                scan_search(conn, &embedding, limit, &filter)
            }
        })
        .await
    }

    /// Same search restricted to one project's sessions.
    pub async fn search_similar_in_project(
        &self,
        embedding: Vec<f32>,
        working_dir: &str,
        limit: usize,
    ) -> Result<Vec<SimilarHit>, StoreError> {
        self.search_similar(
            embedding,
            limit,
            SearchFilter {
                working_dir: Some(working_dir.to_string()),
                ..Default::default()
            },
        )
        .await
    }
}

fn hit_passes(filter: &SearchFilter, hit: &SimilarHit, working_dir: &str) -> bool {
    if filter.exclude_session.as_deref() == Some(hit.session_id.as_str()) {
        return false;
    }
    if filter.exclude_conversation == Some(hit.conversation_id) {
        return false;
    }
    if let Some(ref wd) = filter.working_dir {
        if wd != working_dir {
            return false;
        }
    }
    true
}

/// KNN path: over-fetch from vec0 (filters cut into the k results), join the
/// conversation rows, then filter and trim.
fn knn_search(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<SimilarHit>, StoreError> {
    let k = (limit * 4).max(50);
    let sql = format!(
        "SELECT v.rowid, v.distance, c.session_id, c.prompt, c.created_at, s.working_dir \
         FROM {} v \
         JOIN conversations c ON c.id = v.rowid \
         JOIN sessions s ON s.id = c.session_id \
         WHERE v.embedding MATCH ?1 AND k = ?2",
        VEC_TABLE
    );
    let mut stmt = conn.prepare(&sql).map_err(map_sql)?;
    let rows = stmt
        .query_map(params![vector_to_json(embedding), k as i64], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .map_err(map_sql)?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, distance, session_id, prompt, created_at, working_dir) = row.map_err(map_sql)?;
        let hit = SimilarHit {
            conversation_id: id,
            session_id,
            prompt,
            similarity: 1.0 - distance as f32,
            created_at,
        };
        if hit_passes(filter, &hit, &working_dir) {
            hits.push(hit);
        }
        if hits.len() == limit {
            break;
        }
    }
    Ok(hits)
}

/// Exact-scan fallback: decode every stored blob and rank in memory.
fn scan_search(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<SimilarHit>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.embedding, c.session_id, c.prompt, c.created_at, s.working_dir \
             FROM conversations c JOIN sessions s ON s.id = c.session_id \
             WHERE c.embedding IS NOT NULL",
        )
        .map_err(map_sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Vec<u8>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .map_err(map_sql)?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, blob, session_id, prompt, created_at, working_dir) = row.map_err(map_sql)?;
        let stored = blob_to_embedding(&blob)?;
        if stored.len() != embedding.len() {
            continue;
        }
        let hit = SimilarHit {
            conversation_id: id,
            session_id,
            prompt,
            similarity: cosine_similarity(embedding, &stored),
            created_at,
        };
        if hit_passes(filter, &hit, &working_dir) {
            hits.push(hit);
        }
    }
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    Ok(hits)
}
