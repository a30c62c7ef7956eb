use rusqlite::Connection;

use crate::error::Result;

/// Durable turn log, owned by this crate (mirrors `skynet-memory`'s practice
/// of each manager holding its own SQLite connection rather than sharing the
/// repository's).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_turns (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id     TEXT NOT NULL,
            role           TEXT NOT NULL,
            content        TEXT,
            tool_calls     TEXT,
            tool_call_id   TEXT,
            tool_name      TEXT,
            created_at     TEXT NOT NULL,
            model          TEXT,
            token_count    INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_turns_session ON conversation_turns(session_id, created_at);",
    )?;
    Ok(())
}
