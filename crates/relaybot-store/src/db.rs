use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table owned by the repository. Safe to call on every
/// startup — `IF NOT EXISTS` throughout, matching `skynet-sessions::db`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bots (
            id               TEXT PRIMARY KEY,
            provider         TEXT NOT NULL,
            model            TEXT NOT NULL,
            system_prompt    TEXT,
            temperature      REAL NOT NULL DEFAULT 0.7,
            message_delay_ms INTEGER NOT NULL DEFAULT 0,
            ignored_labels   TEXT NOT NULL DEFAULT '[]',
            exclude_groups   INTEGER NOT NULL DEFAULT 0,
            ai_enabled       INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id             TEXT PRIMARY KEY,
            bot_id         TEXT NOT NULL,
            identifier     TEXT NOT NULL,
            display_name   TEXT,
            platform       TEXT NOT NULL DEFAULT 'whatsapp',
            status         TEXT NOT NULL DEFAULT 'active',
            message_count  INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            UNIQUE(bot_id, identifier)
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_bot ON sessions(bot_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            session_id  TEXT NOT NULL,
            external_id TEXT UNIQUE,
            sender      TEXT NOT NULL,
            from_me     INTEGER NOT NULL DEFAULT 0,
            content     TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'TEXT',
            media_url   TEXT,
            is_processed INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_session_inbound
            ON messages(session_id, from_me, created_at DESC);

        CREATE TABLE IF NOT EXISTS tools (
            id                 TEXT PRIMARY KEY,
            bot_id             TEXT NOT NULL,
            name               TEXT NOT NULL,
            description        TEXT NOT NULL,
            parameters_schema  TEXT NOT NULL,
            action_type        TEXT NOT NULL,
            action_config      TEXT NOT NULL,
            status             TEXT NOT NULL DEFAULT 'ACTIVE',
            flow_id            TEXT,
            UNIQUE(bot_id, name)
        );

        CREATE TABLE IF NOT EXISTS flows (
            id     TEXT PRIMARY KEY,
            bot_id TEXT NOT NULL,
            name   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flow_steps (
            flow_id    TEXT NOT NULL,
            step_order INTEGER NOT NULL,
            step_type  TEXT NOT NULL,
            content    TEXT,
            media_url  TEXT,
            delay_ms   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (flow_id, step_order)
        );

        CREATE TABLE IF NOT EXISTS triggers (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            flow_id    TEXT NOT NULL,
            keyword    TEXT NOT NULL,
            match_type TEXT NOT NULL,
            scope      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS labels (
            id          TEXT PRIMARY KEY,
            bot_id      TEXT NOT NULL,
            wa_label_id TEXT NOT NULL,
            name        TEXT NOT NULL,
            UNIQUE(bot_id, wa_label_id)
        );

        CREATE TABLE IF NOT EXISTS session_labels (
            session_id TEXT NOT NULL,
            label_id   TEXT NOT NULL,
            UNIQUE(session_id, label_id)
        );

        CREATE TABLE IF NOT EXISTS automations (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            name       TEXT NOT NULL,
            enabled    INTEGER NOT NULL DEFAULT 1,
            label_name TEXT,
            timeout_ms INTEGER NOT NULL,
            prompt     TEXT NOT NULL,
            UNIQUE(bot_id, name)
        );

        CREATE TABLE IF NOT EXISTS executions (
            id            TEXT PRIMARY KEY,
            flow_id       TEXT NOT NULL,
            session_id    TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'RUNNING',
            current_step  INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clients (
            id          TEXT PRIMARY KEY,
            bot_id      TEXT NOT NULL,
            curp        TEXT NOT NULL,
            phone       TEXT,
            email       TEXT,
            credentials TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(bot_id, curp)
        );",
    )?;
    Ok(())
}
