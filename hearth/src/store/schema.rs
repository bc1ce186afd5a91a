//! Schema creation and forward-only migrations keyed by `PRAGMA user_version`.

use rusqlite::Connection;

use super::{map_sql, StoreError};

const SCHEMA_VERSION: i64 = 1;

const V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    working_dir TEXT NOT NULL,
    project_type TEXT,
    personality TEXT NOT NULL DEFAULT 'default',
    medium TEXT NOT NULL DEFAULT 'cli',
    user_id TEXT,
    continued_from TEXT,
    swarm_id TEXT,
    swarm_agent_id TEXT,
    locked INTEGER NOT NULL DEFAULT 0,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    summary TEXT,
    key_topics TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_working_dir ON sessions(working_dir);
CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON sessions(start_time);

CREATE TABLE IF NOT EXISTS session_personalities (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    personality TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_mcp_servers (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    server TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    message_type TEXT NOT NULL CHECK (message_type IN ('user','assistant','system')),
    prompt TEXT NOT NULL,
    personality TEXT NOT NULL DEFAULT 'default',
    medium TEXT NOT NULL DEFAULT 'cli',
    user_id TEXT,
    ttft_ms INTEGER,
    response_ms INTEGER,
    thinking_ms INTEGER,
    tool_count INTEGER NOT NULL DEFAULT 0,
    tool_names TEXT NOT NULL DEFAULT '[]',
    embedding BLOB,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id, created_at);

CREATE TABLE IF NOT EXISTS conversation_blocks (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    ord INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('text','thinking','tool_use','tool_result')),
    text TEXT,
    tool_name TEXT,
    tool_use_id TEXT,
    input TEXT,
    output TEXT,
    is_error INTEGER
);
CREATE INDEX IF NOT EXISTS idx_blocks_conversation ON conversation_blocks(conversation_id, ord);

CREATE TABLE IF NOT EXISTS task_queue (
    id INTEGER PRIMARY KEY,
    task_type TEXT NOT NULL,
    model_name TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','processing','completed','failed')),
    session_id TEXT,
    created_at INTEGER NOT NULL,
    processing_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_queue_claim ON task_queue(status, priority DESC, created_at);

CREATE TABLE IF NOT EXISTS context_cache (
    session_id TEXT PRIMARY KEY,
    context TEXT NOT NULL,
    sources TEXT NOT NULL DEFAULT '[]',
    token_estimate INTEGER NOT NULL DEFAULT 0,
    built_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    summary_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    key_topics TEXT NOT NULL DEFAULT '[]',
    key_entities TEXT NOT NULL DEFAULT '[]',
    task_status TEXT,
    next_steps TEXT,
    model TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_session ON session_summaries(session_id, created_at);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'concept',
    session_id TEXT,
    mention_count INTEGER NOT NULL DEFAULT 1,
    last_seen INTEGER NOT NULL,
    UNIQUE(name, kind)
);

CREATE TABLE IF NOT EXISTS entity_relations (
    id INTEGER PRIMARY KEY,
    from_id INTEGER NOT NULL REFERENCES entities(id),
    to_id INTEGER NOT NULL REFERENCES entities(id),
    relation TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_citations (
    id INTEGER PRIMARY KEY,
    entity_id INTEGER NOT NULL REFERENCES entities(id),
    session_id TEXT NOT NULL,
    cited_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS swarms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    working_dir TEXT NOT NULL,
    branch_prefix TEXT,
    base_branch TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','running','completed','failed','cancelled')),
    auto_synthesize INTEGER NOT NULL DEFAULT 0,
    synthesis_prompt TEXT,
    skip_synthesis_on_failure INTEGER NOT NULL DEFAULT 0,
    supervise INTEGER NOT NULL DEFAULT 0,
    supervisor_warn_secs INTEGER,
    supervisor_cancel_secs INTEGER,
    parent_session_id TEXT,
    synthesis_output TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS swarm_agents (
    id TEXT PRIMARY KEY,
    swarm_id TEXT NOT NULL REFERENCES swarms(id),
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'worker',
    mode TEXT NOT NULL DEFAULT 'assigned' CHECK (mode IN ('assigned','autonomous')),
    prompt TEXT NOT NULL,
    is_synthesis INTEGER NOT NULL DEFAULT 0,
    personality TEXT,
    plugins TEXT NOT NULL DEFAULT '[]',
    allowed_tools TEXT NOT NULL DEFAULT '[]',
    model TEXT,
    sandbox INTEGER NOT NULL DEFAULT 1,
    depends_on TEXT NOT NULL DEFAULT '[]',
    timeout_secs INTEGER,
    goal TEXT,
    capabilities TEXT NOT NULL DEFAULT '[]',
    task_types TEXT NOT NULL DEFAULT '[]',
    max_tasks INTEGER,
    max_duration_secs INTEGER,
    idle_timeout_secs INTEGER,
    tasks_completed INTEGER NOT NULL DEFAULT 0,
    tasks_failed INTEGER NOT NULL DEFAULT 0,
    current_task_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','running','completed','failed','skipped','cancelled')),
    output TEXT,
    output_summary TEXT,
    error_message TEXT,
    tool_count INTEGER NOT NULL DEFAULT 0,
    session_id TEXT,
    started_at INTEGER,
    completed_at INTEGER,
    UNIQUE(swarm_id, name)
);

CREATE TABLE IF NOT EXISTS swarm_scratchpad (
    swarm_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    agent_name TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(swarm_id, key)
);

CREATE TABLE IF NOT EXISTS project_tasks (
    id TEXT PRIMARY KEY,
    working_dir TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    task_type TEXT NOT NULL DEFAULT 'task',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'ready'
        CHECK (status IN ('ready','claimed','in_progress','done','blocked','cancelled')),
    claimed_by_agent TEXT,
    claimed_by_session TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    extra TEXT NOT NULL DEFAULT '{}',
    discovered_from TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_project_tasks_claim ON project_tasks(status, task_type, priority DESC);

CREATE TABLE IF NOT EXISTS exploration_findings (
    id INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES project_tasks(id),
    finding TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    worth_sharing INTEGER NOT NULL DEFAULT 0,
    share_message TEXT,
    shared INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE(task_id, finding)
);

CREATE TABLE IF NOT EXISTS mission_executions (
    id INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
    detail TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);
"#;

/// Applies pending migrations. Fatal on error: the daemon must not run
/// against a half-migrated database.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .map_err(map_sql)?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    if version < 1 {
        conn.execute_batch(V1).map_err(map_sql)?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(map_sql)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn core_tables_exist_after_migrate() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in [
            "sessions",
            "conversations",
            "conversation_blocks",
            "task_queue",
            "context_cache",
            "session_summaries",
            "swarms",
            "swarm_agents",
            "swarm_scratchpad",
            "project_tasks",
            "exploration_findings",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
