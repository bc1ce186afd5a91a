//! SQLite-backed system of record with vector search over conversation
//! embeddings.
//!
//! One database file, opened with WAL, busy-timeout 30 s, synchronous=NORMAL,
//! and foreign keys enforced. Operations open a short-lived connection inside
//! `spawn_blocking`; WAL makes this cheap and keeps the store `Send + Sync`
//! without a connection pool. Lock conflicts are retried with exponential
//! backoff plus jitter, three attempts.
//!
//! Embeddings are little-endian f32 blobs on the `conversations` table,
//! mirrored into a `vec0` virtual table for cosine KNN. When the sqlite-vec
//! extension cannot create the table the store degrades to an exact scan and
//! logs once.

pub mod context_cache;
pub mod conversation;
pub mod entity;
pub mod project_task;
pub mod schema;
pub mod search;
pub mod session;
pub mod stats;
pub mod summary;
pub mod swarm;

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;

use crate::error::{ErrorKind, Kinded};

static SQLITE_VEC_INIT: Once = Once::new();

/// Storage error. `Busy` is transient and retried internally; surviving `Busy`
/// values mean three attempts were exhausted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("database busy: {0}")]
    Busy(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Kinded for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Busy(_) => ErrorKind::Transient,
            StoreError::Storage(_) => ErrorKind::Internal,
            StoreError::InvalidData(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

/// Maps a rusqlite error, classifying lock conflicts as `Busy`.
pub(crate) fn map_sql(e: rusqlite::Error) -> StoreError {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(f, ref msg) = e {
        if matches!(
            f.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return StoreError::Busy(msg.clone().unwrap_or_else(|| f.to_string()));
        }
    }
    StoreError::Storage(e.to_string())
}

/// Current time as unix milliseconds; every `*_at` column stores this.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn millis_to_rfc3339(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Encodes an embedding as a little-endian f32 blob.
pub fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

/// Decodes a little-endian f32 blob; trailing partial floats are an error.
pub fn blob_to_embedding(b: &[u8]) -> Result<Vec<f32>, StoreError> {
    if b.len() % 4 != 0 {
        return Err(StoreError::InvalidData(format!(
            "embedding blob length {} not a multiple of 4",
            b.len()
        )));
    }
    Ok(b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Cosine similarity; 0.0 when either vector is all-zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Formats a vector as the JSON text sqlite-vec accepts for `MATCH`.
pub(crate) fn vector_to_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Name of the vec0 virtual table mirroring conversation embeddings.
pub(crate) const VEC_TABLE: &str = "conversation_vec";

/// SQLite store handle. Cheap to clone; all state lives in the database file.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    embed_dim: usize,
    vec_index: bool,
}

impl Store {
    /// Opens (creating if needed) the database, runs migrations, and prepares
    /// the vector index. Schema errors are fatal; a missing sqlite-vec
    /// extension degrades to exact-scan search with a single warning.
    pub fn open(path: impl AsRef<Path>, embed_dim: usize) -> Result<Self, StoreError> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(map_sql)?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
            .map_err(map_sql)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(map_sql)?;
        conn.busy_timeout(Duration::from_secs(30)).map_err(map_sql)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sql)?;

        schema::migrate(&conn)?;

        let create_vec = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(embedding float[{}] distance_metric=cosine)",
            VEC_TABLE, embed_dim
        );
        let vec_index = match conn.execute(&create_vec, []) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    "vector index unavailable, similarity search degrades to exact scan: {}",
                    e
                );
                false
            }
        };

        let store = Self {
            db_path,
            embed_dim,
            vec_index,
        };
        if vec_index {
            store.rebuild_vec_index_if_stale(&conn)?;
        }
        Ok(store)
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Whether KNN search uses the vec0 index (false means exact scan).
    pub fn vec_index_available(&self) -> bool {
        self.vec_index
    }

    pub(crate) fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Back-fills the vec0 table when its row count differs from the count of
    /// embedded conversations (rows inserted while a prior open was degraded).
    fn rebuild_vec_index_if_stale(&self, conn: &Connection) -> Result<(), StoreError> {
        let embedded: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE embedding IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .map_err(map_sql)?;
        let indexed: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", VEC_TABLE), [], |r| {
                r.get(0)
            })
            .map_err(map_sql)?;
        if embedded == indexed {
            return Ok(());
        }
        tracing::info!(embedded, indexed, "rebuilding vector index");
        conn.execute(&format!("DELETE FROM {}", VEC_TABLE), [])
            .map_err(map_sql)?;
        let mut stmt = conn
            .prepare("SELECT id, embedding FROM conversations WHERE embedding IS NOT NULL")
            .map_err(map_sql)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)))
            .map_err(map_sql)?;
        for row in rows {
            let (id, blob) = row.map_err(map_sql)?;
            let vec = blob_to_embedding(&blob)?;
            if vec.len() != self.embed_dim {
                continue;
            }
            conn.execute(
                &format!("INSERT INTO {} (rowid, embedding) VALUES (?1, ?2)", VEC_TABLE),
                rusqlite::params![id, vector_to_json(&vec)],
            )
            .map_err(map_sql)?;
        }
        Ok(())
    }

    /// Runs `f` with a fresh connection on the blocking pool, retrying lock
    /// conflicts up to three attempts with doubling backoff and jitter.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut delay = Duration::from_millis(50);
            for attempt in 1..=3u32 {
                let conn = Connection::open(&db_path).map_err(map_sql)?;
                conn.busy_timeout(Duration::from_secs(30)).map_err(map_sql)?;
                conn.pragma_update(None, "foreign_keys", "ON")
                    .map_err(map_sql)?;
                match f(&conn) {
                    Err(StoreError::Busy(msg)) if attempt < 3 => {
                        tracing::debug!(attempt, "database busy, retrying: {}", msg);
                        std::thread::sleep(jittered(delay));
                        delay *= 2;
                    }
                    other => return other,
                }
            }
            unreachable!("retry loop returns on the final attempt")
        })
        .await
        .map_err(|e| StoreError::Storage(format!("blocking task join: {}", e)))?
    }
}

/// ±25 % jitter derived from the clock's subsecond nanos.
fn jittered(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    let base_ms = base.as_millis() as u64;
    let spread = (base_ms / 2).max(1);
    Duration::from_millis(base_ms * 3 / 4 + nanos % spread)
}
