//! Conversation rows and their ordered blocks. Embeddings arrive later via
//! [`Store::update_conversation_embedding`]; inserts never block on the
//! embedding service.

use rusqlite::{params, Connection, OptionalExtension};

use super::{
    blob_to_embedding, embedding_to_blob, map_sql, now_millis, vector_to_json, Store, StoreError,
    VEC_TABLE,
};

/// Role of one conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    User,
    Assistant,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(MessageType::User),
            "assistant" => Ok(MessageType::Assistant),
            "system" => Ok(MessageType::System),
            other => Err(StoreError::InvalidData(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }
}

/// One ordered component of a conversation. Conversations exist even when the
/// text is empty; blocks carry the structured detail.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
}

/// Parameters for [`Store::store_conversation`].
#[derive(Clone, Debug, Default)]
pub struct NewConversation {
    pub session_id: String,
    pub prompt: String,
    pub message_type: &'static str,
    pub personality: String,
    pub medium: String,
    pub user_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConversationRow {
    pub id: i64,
    pub session_id: String,
    pub message_type: String,
    pub prompt: String,
    pub personality: String,
    pub tool_count: i64,
    pub created_at: i64,
}

/// Latency counters captured after an assistant turn completes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Latency {
    pub ttft_ms: Option<i64>,
    pub response_ms: Option<i64>,
    pub thinking_ms: Option<i64>,
}

impl Store {
    /// Inserts a conversation without an embedding and returns its id.
    pub async fn store_conversation(&self, new: NewConversation) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (session_id, message_type, prompt, personality, \
                 medium, user_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.session_id,
                    new.message_type,
                    new.prompt,
                    if new.personality.is_empty() { "default" } else { new.personality.as_str() },
                    if new.medium.is_empty() { "cli" } else { new.medium.as_str() },
                    new.user_id,
                    now_millis(),
                ],
            )
            .map_err(map_sql)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Appends ordered blocks after any existing ones.
    pub async fn append_blocks(
        &self,
        conversation_id: i64,
        blocks: Vec<Block>,
    ) -> Result<(), StoreError> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_sql)?;
            let start: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(ord), -1) + 1 FROM conversation_blocks WHERE conversation_id = ?1",
                    params![conversation_id],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            for (i, block) in blocks.iter().enumerate() {
                let ord = start + i as i64;
                match block {
                    Block::Text(text) => tx.execute(
                        "INSERT INTO conversation_blocks (conversation_id, ord, kind, text) \
                         VALUES (?1, ?2, 'text', ?3)",
                        params![conversation_id, ord, text],
                    ),
                    Block::Thinking(text) => tx.execute(
                        "INSERT INTO conversation_blocks (conversation_id, ord, kind, text) \
                         VALUES (?1, ?2, 'thinking', ?3)",
                        params![conversation_id, ord, text],
                    ),
                    Block::ToolUse { id, name, input } => tx.execute(
                        "INSERT INTO conversation_blocks (conversation_id, ord, kind, tool_name, \
                         tool_use_id, input) VALUES (?1, ?2, 'tool_use', ?3, ?4, ?5)",
                        params![conversation_id, ord, name, id, serde_json::to_string(input)?],
                    ),
                    Block::ToolResult {
                        tool_use_id,
                        output,
                        is_error,
                    } => tx.execute(
                        "INSERT INTO conversation_blocks (conversation_id, ord, kind, tool_use_id, \
                         output, is_error) VALUES (?1, ?2, 'tool_result', ?3, ?4, ?5)",
                        params![conversation_id, ord, tool_use_id, output, *is_error as i64],
                    ),
                }
                .map_err(map_sql)?;
            }
            tx.commit().map_err(map_sql)
        })
        .await
    }

    /// Reads the ordered blocks of one conversation.
    pub async fn blocks(&self, conversation_id: i64) -> Result<Vec<Block>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT kind, text, tool_name, tool_use_id, input, output, is_error \
                     FROM conversation_blocks WHERE conversation_id = ?1 ORDER BY ord",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![conversation_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<String>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, Option<i64>>(6)?,
                    ))
                })
                .map_err(map_sql)?;
            let mut out = Vec::new();
            for row in rows {
                let (kind, text, tool_name, tool_use_id, input, output, is_error) =
                    row.map_err(map_sql)?;
                let block = match kind.as_str() {
                    "text" => Block::Text(text.unwrap_or_default()),
                    "thinking" => Block::Thinking(text.unwrap_or_default()),
                    "tool_use" => Block::ToolUse {
                        id: tool_use_id.unwrap_or_default(),
                        name: tool_name.unwrap_or_default(),
                        input: input
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or(serde_json::Value::Null),
                    },
                    "tool_result" => Block::ToolResult {
                        tool_use_id: tool_use_id.unwrap_or_default(),
                        output: output.unwrap_or_default(),
                        is_error: is_error.unwrap_or(0) != 0,
                    },
                    other => {
                        return Err(StoreError::InvalidData(format!(
                            "unknown block kind: {}",
                            other
                        )))
                    }
                };
                out.push(block);
            }
            Ok(out)
        })
        .await
    }

    /// Writes the embedding blob and mirrors it into the vec0 index when
    /// available. Idempotent per conversation.
    pub async fn update_conversation_embedding(
        &self,
        conversation_id: i64,
        embedding: Vec<f32>,
    ) -> Result<(), StoreError> {
        if embedding.len() != self.embed_dim() {
            return Err(StoreError::InvalidData(format!(
                "embedding dimension {} != expected {}",
                embedding.len(),
                self.embed_dim()
            )));
        }
        let vec_index = self.vec_index_available();
        self.with_conn(move |conn| {
            let blob = embedding_to_blob(&embedding);
            let n = conn
                .execute(
                    "UPDATE conversations SET embedding = ?1 WHERE id = ?2",
                    params![blob, conversation_id],
                )
                .map_err(map_sql)?;
            if n == 0 {
                return Err(StoreError::NotFound("conversation"));
            }
            if vec_index {
                upsert_vec(conn, conversation_id, &embedding)?;
            }
            Ok(())
        })
        .await
    }

    /// Records latency counters and tool usage after an assistant turn.
    pub async fn update_conversation_latency(
        &self,
        conversation_id: i64,
        latency: Latency,
        tool_count: u32,
        tool_names: Vec<String>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET ttft_ms = ?1, response_ms = ?2, thinking_ms = ?3, \
                 tool_count = ?4, tool_names = ?5 WHERE id = ?6",
                params![
                    latency.ttft_ms,
                    latency.response_ms,
                    latency.thinking_ms,
                    tool_count as i64,
                    serde_json::to_string(&tool_names)?,
                    conversation_id,
                ],
            )
            .map_err(map_sql)?;
            Ok(())
        })
        .await
    }

    /// Most recent conversations of one session, newest first.
    pub async fn recent_conversations(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, message_type, prompt, personality, tool_count, created_at \
                     FROM conversations WHERE session_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )
                .map_err(map_sql)?;
            let rows = stmt
                .query_map(params![session_id, limit as i64], |r| {
                    Ok(ConversationRow {
                        id: r.get(0)?,
                        session_id: r.get(1)?,
                        message_type: r.get(2)?,
                        prompt: r.get(3)?,
                        personality: r.get(4)?,
                        tool_count: r.get(5)?,
                        created_at: r.get(6)?,
                    })
                })
                .map_err(map_sql)?;
            rows.collect::<Result<_, _>>().map_err(map_sql)
        })
        .await
    }

    pub async fn conversation_count(&self, session_id: &str) -> Result<i64, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .map_err(map_sql)
        })
        .await
    }

    /// The stored embedding of one conversation, when present.
    pub async fn conversation_embedding(
        &self,
        conversation_id: i64,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let blob: Option<Vec<u8>> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT embedding FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)
                .map(Option::flatten)
            })
            .await?;
        blob.map(|b| blob_to_embedding(&b)).transpose()
    }
}

fn upsert_vec(conn: &Connection, rowid: i64, embedding: &[f32]) -> Result<(), StoreError> {
    conn.execute(
        &format!("DELETE FROM {} WHERE rowid = ?1", VEC_TABLE),
        params![rowid],
    )
    .map_err(map_sql)?;
    conn.execute(
        &format!("INSERT INTO {} (rowid, embedding) VALUES (?1, ?2)", VEC_TABLE),
        params![rowid, vector_to_json(embedding)],
    )
    .map_err(map_sql)?;
    Ok(())
}
