use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};
use uuid::Uuid;

use relaybot_core::types::*;

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// CRUD on Bot/Session/Message/Tool/Flow/Label/SessionLabel/Automation/Execution
/// (spec.md §6 "Repository"). Wraps a single SQLite connection in a `Mutex` —
/// sufficient for the single-node target, same tradeoff `skynet-sessions`
/// documents for its own `Mutex<Connection>`.
pub struct SqliteRepository {
    db: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    // -- Bots ---------------------------------------------------------------

    pub fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, provider, model, system_prompt, temperature, message_delay_ms,
                    ignored_labels, exclude_groups, ai_enabled
             FROM bots WHERE id = ?1",
            params![bot_id],
            row_to_bot,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn upsert_bot(&self, bot: &Bot) -> Result<()> {
        let db = self.db.lock().unwrap();
        let ignored = serde_json::to_string(&bot.ignored_labels).unwrap_or_else(|_| "[]".into());
        db.execute(
            "INSERT INTO bots (id, provider, model, system_prompt, temperature,
                message_delay_ms, ignored_labels, exclude_groups, ai_enabled)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(id) DO UPDATE SET
                provider=excluded.provider, model=excluded.model,
                system_prompt=excluded.system_prompt, temperature=excluded.temperature,
                message_delay_ms=excluded.message_delay_ms, ignored_labels=excluded.ignored_labels,
                exclude_groups=excluded.exclude_groups, ai_enabled=excluded.ai_enabled",
            params![
                bot.id,
                bot.provider.to_string(),
                bot.model,
                bot.system_prompt,
                bot.temperature,
                bot.message_delay_ms as i64,
                ignored,
                bot.exclude_groups as i64,
                bot.ai_enabled as i64,
            ],
        )?;
        Ok(())
    }

    /// All configured bots, used at startup to bring every transport session
    /// up before the gateway starts accepting traffic.
    pub fn list_bots(&self) -> Result<Vec<Bot>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, provider, model, system_prompt, temperature, message_delay_ms,
                    ignored_labels, exclude_groups, ai_enabled
             FROM bots",
        )?;
        let rows = stmt.query_map([], row_to_bot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    // -- Sessions -------------------------------------------------------------

    /// Return an existing session or create a new one. Idempotent under a
    /// unique-key race: a second creator re-reads and reuses the winner's row
    /// (spec.md §3 "Session" lifecycle invariant).
    #[instrument(skip(self), fields(bot_id, identifier))]
    pub fn get_or_create_session(
        &self,
        bot_id: &str,
        identifier: &str,
        display_name: Option<&str>,
        platform: &str,
    ) -> Result<Session> {
        if let Some(s) = self.get_session(bot_id, identifier)? {
            return Ok(s);
        }

        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (id, bot_id, identifier, display_name, platform, status, message_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,'active',0,?6,?6)",
            params![id, bot_id, identifier, display_name, platform, now],
        )?;
        drop(db);

        // Re-read regardless of which branch won the race — the row we get
        // back is authoritative either way.
        self.get_session(bot_id, identifier)?
            .ok_or_else(|| StoreError::Invalid("session vanished after insert".into()))
    }

    pub fn get_session(&self, bot_id: &str, identifier: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, bot_id, identifier, display_name, platform, status,
                    message_count, created_at, updated_at
             FROM sessions WHERE bot_id = ?1 AND identifier = ?2",
            params![bot_id, identifier],
            row_to_session,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_session_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, bot_id, identifier, display_name, platform, status,
                    message_count, created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn bump_session_stats(&self, session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(())
    }

    /// Sessions for `bot_id` tagged with `label_name`, excluding any session
    /// that also holds a label in `ignored_labels` (spec.md §4.8).
    pub fn sessions_by_label(
        &self,
        bot_id: &str,
        label_name: &str,
        ignored_labels: &[String],
    ) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT s.id, s.bot_id, s.identifier, s.display_name, s.platform, s.status,
                    s.message_count, s.created_at, s.updated_at
             FROM sessions s
             JOIN session_labels sl ON sl.session_id = s.id
             JOIN labels l ON l.id = sl.label_id
             WHERE s.bot_id = ?1 AND l.name = ?2 COLLATE NOCASE",
        )?;
        let rows: Vec<Session> = stmt
            .query_map(params![bot_id, label_name], row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        let mut out = Vec::new();
        for s in rows {
            if ignored_labels.is_empty() || !self.session_has_any_label(&s.id, ignored_labels)? {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Sessions for `bot_id` with no labels at all (spec.md §4.8 "Otherwise").
    pub fn sessions_without_labels(&self, bot_id: &str) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT s.id, s.bot_id, s.identifier, s.display_name, s.platform, s.status,
                    s.message_count, s.created_at, s.updated_at
             FROM sessions s
             WHERE s.bot_id = ?1
               AND NOT EXISTS (SELECT 1 FROM session_labels sl WHERE sl.session_id = s.id)",
        )?;
        let rows = stmt
            .query_map(params![bot_id], row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn session_has_any_label(&self, session_id: &str, names: &[String]) -> Result<bool> {
        if names.is_empty() {
            return Ok(false);
        }
        let db = self.db.lock().unwrap();
        let placeholders = names.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM session_labels sl
             JOIN labels l ON l.id = sl.label_id
             WHERE sl.session_id = ? AND l.name IN ({placeholders}) COLLATE NOCASE"
        );
        let mut stmt = db.prepare(&sql)?;
        let mut p: Vec<&dyn rusqlite::ToSql> = vec![&session_id];
        for n in names {
            p.push(n);
        }
        let count: i64 = stmt.query_row(p.as_slice(), |row| row.get(0))?;
        Ok(count > 0)
    }

    // -- Messages ---------------------------------------------------------------

    /// Atomic upsert on `external_id`. Returns `(message, created)` — only
    /// `created == true` rows should proceed to AI/flow evaluation
    /// (spec.md §5 "at-most-once downstream processing per externalId").
    #[instrument(skip(self, content), fields(session_id, external_id))]
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_inbound_message(
        &self,
        session_id: &str,
        external_id: Option<&str>,
        sender: &str,
        from_me: bool,
        content: &str,
        message_type: MessageType,
        media_url: Option<&str>,
    ) -> Result<(Message, bool)> {
        // Messages with no externalId (synthetic automation turns) are
        // always "created" — there is nothing to dedup against.
        let Some(ext) = external_id else {
            let msg = self.insert_message(
                session_id, None, sender, from_me, content, message_type, media_url,
            )?;
            return Ok((msg, true));
        };

        if let Some(existing) = self.get_message_by_external_id(ext)? {
            debug!(external_id = ext, "message already processed, dedup hit");
            return Ok((existing, false));
        }

        // Race: two concurrent upserts for the same externalId. INSERT OR IGNORE
        // makes the loser's insert a no-op; both branches then re-read and
        // return the same row, with `created` only true for the actual winner.
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "INSERT OR IGNORE INTO messages
             (id, session_id, external_id, sender, from_me, content, message_type,
              media_url, is_processed, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,0,?9)",
            params![
                id,
                session_id,
                ext,
                sender,
                from_me as i64,
                content,
                type_str(message_type),
                media_url,
                now
            ],
        )?;
        drop(db);

        let msg = self
            .get_message_by_external_id(ext)?
            .ok_or_else(|| StoreError::Invalid("message vanished after insert".into()))?;
        Ok((msg, changed > 0))
    }

    fn insert_message(
        &self,
        session_id: &str,
        external_id: Option<&str>,
        sender: &str,
        from_me: bool,
        content: &str,
        message_type: MessageType,
        media_url: Option<&str>,
    ) -> Result<Message> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (id, session_id, external_id, sender, from_me, content, message_type,
              media_url, is_processed, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,0,?9)",
            params![
                id,
                session_id,
                external_id,
                sender,
                from_me as i64,
                content,
                type_str(message_type),
                media_url,
                now
            ],
        )?;
        Ok(Message {
            id,
            session_id: session_id.to_string(),
            external_id: external_id.map(String::from),
            sender: sender.to_string(),
            from_me,
            content: content.to_string(),
            message_type,
            media_url: media_url.map(String::from),
            is_processed: false,
            created_at: now,
        })
    }

    pub fn get_message_by_external_id(&self, external_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session_id, external_id, sender, from_me, content, message_type,
                    media_url, is_processed, created_at
             FROM messages WHERE external_id = ?1",
            params![external_id],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_message_by_id(&self, id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session_id, external_id, sender, from_me, content, message_type,
                    media_url, is_processed, created_at
             FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn mark_processed(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("UPDATE messages SET is_processed = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Most recent inbound (`from_me = false`) message for a session, if any
    /// (spec.md §4.8 automation staleness check).
    pub fn last_inbound_message(&self, session_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session_id, external_id, sender, from_me, content, message_type,
                    media_url, is_processed, created_at
             FROM messages
             WHERE session_id = ?1 AND from_me = 0
             ORDER BY created_at DESC LIMIT 1",
            params![session_id],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Load messages by id, ordered by `created_at ASC` (spec.md §4.6 step 6 drain).
    pub fn get_messages_by_ids(&self, ids: &[String]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().unwrap();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, session_id, external_id, sender, from_me, content, message_type,
                    media_url, is_processed, created_at
             FROM messages WHERE id IN ({placeholders}) ORDER BY created_at ASC"
        );
        let mut stmt = db.prepare(&sql)?;
        let p: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(p.as_slice(), row_to_message)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    // -- Tools --------------------------------------------------------------

    /// All ACTIVE tool rows for a bot (spec.md §4.3).
    pub fn list_active_tools(&self, bot_id: &str) -> Result<Vec<ToolRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, name, description, parameters_schema, action_type,
                    action_config, status, flow_id
             FROM tools WHERE bot_id = ?1 AND status = 'ACTIVE'",
        )?;
        let rows = stmt
            .query_map(params![bot_id], row_to_tool)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_active_tool(&self, bot_id: &str, name: &str) -> Result<Option<ToolRow>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, bot_id, name, description, parameters_schema, action_type,
                    action_config, status, flow_id
             FROM tools WHERE bot_id = ?1 AND name = ?2 AND status = 'ACTIVE'",
            params![bot_id, name],
            row_to_tool,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Create a tool row. Fails with `AlreadyExists` if the sanitised name
    /// collides with another row for this bot, or with a built-in name
    /// (spec.md §3 "Tool" invariant — checked by the caller via `reserved`).
    #[allow(clippy::too_many_arguments)]
    pub fn create_tool(
        &self,
        bot_id: &str,
        name: &str,
        description: &str,
        parameters_schema: &serde_json::Value,
        action_type: ActionType,
        action_config: &serde_json::Value,
        flow_id: Option<&str>,
    ) -> Result<ToolRow> {
        if !is_valid_tool_name(name) {
            return Err(StoreError::Invalid(format!(
                "tool name '{name}' must match ^[a-z0-9_]+$"
            )));
        }
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        let res = db.execute(
            "INSERT INTO tools (id, bot_id, name, description, parameters_schema,
                action_type, action_config, status, flow_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'ACTIVE',?8)",
            params![
                id,
                bot_id,
                name,
                description,
                parameters_schema.to_string(),
                action_type_str(action_type),
                action_config.to_string(),
                flow_id,
            ],
        );
        match res {
            Ok(_) => Ok(ToolRow {
                id,
                bot_id: bot_id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                parameters_schema: parameters_schema.clone(),
                action_type,
                action_config: action_config.clone(),
                status: ToolStatus::Active,
                flow_id: flow_id.map(String::from),
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(format!("tool '{name}' already exists")))
            }
            Err(e) => Err(StoreError::from(e)),
        }
    }

    // -- Flows ----------------------------------------------------------------

    pub fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>> {
        let db = self.db.lock().unwrap();
        let flow_row: Option<(String, String)> = db
            .query_row(
                "SELECT id, name FROM flows WHERE id = ?1",
                params![flow_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((id, name)) = flow_row else { return Ok(None) };

        let bot_id: String = db.query_row(
            "SELECT bot_id FROM flows WHERE id = ?1",
            params![flow_id],
            |r| r.get(0),
        )?;

        let mut stmt = db.prepare(
            "SELECT step_order, step_type, content, media_url, delay_ms
             FROM flow_steps WHERE flow_id = ?1 ORDER BY step_order ASC",
        )?;
        let steps = stmt
            .query_map(params![flow_id], |row| {
                let step_type_str: String = row.get(1)?;
                Ok(Step {
                    order: row.get::<_, i64>(0)? as u32,
                    step_type: parse_step_type(&step_type_str),
                    content: row.get(2)?,
                    media_url: row.get(3)?,
                    delay_ms: row.get::<_, i64>(4)? as u64,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(Flow { id, bot_id, name, steps }))
    }

    pub fn create_flow(&self, bot_id: &str, name: &str, steps: &[Step]) -> Result<Flow> {
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO flows (id, bot_id, name) VALUES (?1,?2,?3)",
            params![id, bot_id, name],
        )?;
        for step in steps {
            db.execute(
                "INSERT INTO flow_steps (flow_id, step_order, step_type, content, media_url, delay_ms)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    id,
                    step.order as i64,
                    step_type_str(step.step_type),
                    step.content,
                    step.media_url,
                    step.delay_ms as i64,
                ],
            )?;
        }
        Ok(Flow {
            id,
            bot_id: bot_id.to_string(),
            name: name.to_string(),
            steps: steps.to_vec(),
        })
    }

    pub fn triggers_for_bot(&self, bot_id: &str) -> Result<Vec<Trigger>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, flow_id, keyword, match_type, scope FROM triggers WHERE bot_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![bot_id], |row| {
                let match_type_str: String = row.get(4)?;
                let scope_str: String = row.get(5)?;
                Ok(Trigger {
                    id: row.get(0)?,
                    bot_id: row.get(1)?,
                    flow_id: row.get(2)?,
                    keyword: row.get(3)?,
                    match_type: parse_match_type(&match_type_str),
                    scope: parse_scope(&scope_str),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Reject `Regex` triggers whose pattern is too long or fails to compile
    /// (SPEC_FULL.md Open Question 3) before persisting them.
    pub fn create_trigger(
        &self,
        bot_id: &str,
        flow_id: &str,
        keyword: &str,
        match_type: TriggerMatchType,
        scope: TriggerScope,
    ) -> Result<Trigger> {
        if match_type == TriggerMatchType::Regex {
            if keyword.len() > 200 {
                return Err(StoreError::Invalid("regex trigger pattern exceeds 200 chars".into()));
            }
            regex::Regex::new(keyword)
                .map_err(|e| StoreError::Invalid(format!("invalid regex trigger: {e}")))?;
        }
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO triggers (id, bot_id, flow_id, keyword, match_type, scope)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                id,
                bot_id,
                flow_id,
                keyword,
                match_type_str(match_type),
                scope_str(scope)
            ],
        )?;
        Ok(Trigger {
            id,
            bot_id: bot_id.to_string(),
            flow_id: flow_id.to_string(),
            keyword: keyword.to_string(),
            match_type,
            scope,
        })
    }

    // -- Labels ---------------------------------------------------------------

    pub fn get_label_by_name(&self, bot_id: &str, name: &str) -> Result<Option<Label>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, bot_id, wa_label_id, name FROM labels
             WHERE bot_id = ?1 AND name = ?2 COLLATE NOCASE",
            params![bot_id, name],
            row_to_label,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn upsert_label(&self, bot_id: &str, wa_label_id: &str, name: &str) -> Result<Label> {
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO labels (id, bot_id, wa_label_id, name) VALUES (?1,?2,?3,?4)
             ON CONFLICT(bot_id, wa_label_id) DO UPDATE SET name = excluded.name",
            params![id, bot_id, wa_label_id, name],
        )?;
        drop(db);
        self.get_label_by_name(bot_id, name)?
            .ok_or_else(|| StoreError::Invalid("label vanished after upsert".into()))
    }

    pub fn assign_session_label(&self, session_id: &str, label_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO session_labels (session_id, label_id) VALUES (?1,?2)",
            params![session_id, label_id],
        )?;
        Ok(())
    }

    pub fn remove_session_label(&self, session_id: &str, label_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_labels WHERE session_id = ?1 AND label_id = ?2",
            params![session_id, label_id],
        )?;
        Ok(())
    }

    pub fn labels_for_bot(&self, bot_id: &str) -> Result<Vec<Label>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT id, bot_id, wa_label_id, name FROM labels WHERE bot_id = ?1")?;
        let rows = stmt.query_map(params![bot_id], row_to_label)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    pub fn session_count_for_label(&self, label_id: &str) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM session_labels WHERE label_id = ?1",
            params![label_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // -- Executions -------------------------------------------------------------

    pub fn create_execution(&self, flow_id: &str, session_id: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO executions (id, flow_id, session_id, status, current_step, created_at, updated_at)
             VALUES (?1,?2,?3,'RUNNING',0,?4,?4)",
            params![id, flow_id, session_id, now],
        )?;
        Ok(id)
    }

    pub fn advance_execution(&self, execution_id: &str, step: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE executions SET current_step = ?1, updated_at = ?2 WHERE id = ?3",
            params![step as i64, now, execution_id],
        )?;
        Ok(())
    }

    pub fn finish_execution(&self, execution_id: &str, succeeded: bool) -> Result<()> {
        let status = if succeeded { "COMPLETED" } else { "FAILED" };
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE executions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, execution_id],
        )?;
        Ok(())
    }

    // -- Automations ------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_automation(
        &self,
        bot_id: &str,
        name: &str,
        enabled: bool,
        label_name: Option<&str>,
        timeout_ms: u64,
        prompt: &str,
    ) -> Result<Automation> {
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO automations (id, bot_id, name, enabled, label_name, timeout_ms, prompt)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![id, bot_id, name, enabled as i64, label_name, timeout_ms as i64, prompt],
        )?;
        Ok(Automation {
            id,
            bot_id: bot_id.to_string(),
            name: name.to_string(),
            enabled,
            label_name: label_name.map(String::from),
            timeout_ms,
            prompt: prompt.to_string(),
        })
    }

    /// Enabled automations whose bot has `ai_enabled = true` (spec.md §4.8).
    pub fn list_runnable_automations(&self) -> Result<Vec<Automation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT a.id, a.bot_id, a.name, a.enabled, a.label_name, a.timeout_ms, a.prompt
             FROM automations a
             JOIN bots b ON b.id = a.bot_id
             WHERE a.enabled = 1 AND b.ai_enabled = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Automation {
                    id: row.get(0)?,
                    bot_id: row.get(1)?,
                    name: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                    label_name: row.get(4)?,
                    timeout_ms: row.get::<_, i64>(5)? as u64,
                    prompt: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -- Clients (tenant CRM) ---------------------------------------------------

    pub fn lookup_client(&self, bot_id: &str, curp: &str) -> Result<Option<Client>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, bot_id, curp, phone, email, credentials, created_at, updated_at
             FROM clients WHERE bot_id = ?1 AND curp = ?2",
            params![bot_id, curp],
            row_to_client,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn register_client(
        &self,
        bot_id: &str,
        curp: &str,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> Result<Client> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let res = db.execute(
            "INSERT INTO clients (id, bot_id, curp, phone, email, credentials, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,'{}',?6,?6)",
            params![id, bot_id, curp, phone, email, now],
        );
        match res {
            Ok(_) => Ok(Client {
                id,
                bot_id: bot_id.to_string(),
                curp: curp.to_string(),
                phone: phone.map(String::from),
                email: email.map(String::from),
                credentials: serde_json::json!({}),
                created_at: now.clone(),
                updated_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(format!("client with CURP '{curp}' already exists")))
            }
            Err(e) => Err(StoreError::from(e)),
        }
    }

    pub fn save_client_credentials(
        &self,
        bot_id: &str,
        curp: &str,
        credentials: &serde_json::Value,
    ) -> Result<Client> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE clients SET credentials = ?1, updated_at = ?2 WHERE bot_id = ?3 AND curp = ?4",
            params![credentials.to_string(), now, bot_id, curp],
        )?;
        drop(db);
        if changed == 0 {
            return Err(StoreError::NotFound(format!("client with CURP '{curp}' not found")));
        }
        self.lookup_client(bot_id, curp)?
            .ok_or_else(|| StoreError::Invalid("client vanished after update".into()))
    }
}

// --- row mappers -------------------------------------------------------------

fn row_to_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bot> {
    let provider_str: String = row.get(1)?;
    let ignored_json: String = row.get(6)?;
    Ok(Bot {
        id: row.get(0)?,
        provider: if provider_str == "openai" { ProviderKind::OpenAi } else { ProviderKind::Gemini },
        model: row.get(2)?,
        system_prompt: row.get(3)?,
        temperature: row.get(4)?,
        message_delay_ms: row.get::<_, i64>(5)? as u64,
        ignored_labels: serde_json::from_str(&ignored_json).unwrap_or_default(),
        exclude_groups: row.get::<_, i64>(7)? != 0,
        ai_enabled: row.get::<_, i64>(8)? != 0,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status_str: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        identifier: row.get(2)?,
        display_name: row.get(3)?,
        platform: row.get(4)?,
        status: if status_str == "archived" { SessionStatus::Archived } else { SessionStatus::Active },
        message_count: row.get::<_, i64>(6)? as u64,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_s: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        external_id: row.get(2)?,
        sender: row.get(3)?,
        from_me: row.get::<_, i64>(4)? != 0,
        content: row.get(5)?,
        message_type: parse_message_type(&type_s),
        media_url: row.get(7)?,
        is_processed: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolRow> {
    let action_type_s: String = row.get(5)?;
    let status_s: String = row.get(7)?;
    let schema_s: String = row.get(4)?;
    let config_s: String = row.get(6)?;
    Ok(ToolRow {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        parameters_schema: serde_json::from_str(&schema_s).unwrap_or(serde_json::Value::Null),
        action_type: parse_action_type(&action_type_s),
        action_config: serde_json::from_str(&config_s).unwrap_or(serde_json::Value::Null),
        status: if status_s == "DISABLED" { ToolStatus::Disabled } else { ToolStatus::Active },
        flow_id: row.get(8)?,
    })
}

fn row_to_label(row: &rusqlite::Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        wa_label_id: row.get(2)?,
        name: row.get(3)?,
    })
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let creds_s: String = row.get(5)?;
    Ok(Client {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        curp: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        credentials: serde_json::from_str(&creds_s).unwrap_or(serde_json::Value::Null),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::Text => "TEXT",
        MessageType::Image => "IMAGE",
        MessageType::Audio => "AUDIO",
        MessageType::Document => "DOCUMENT",
    }
}

fn parse_message_type(s: &str) -> MessageType {
    match s {
        "IMAGE" => MessageType::Image,
        "AUDIO" => MessageType::Audio,
        "DOCUMENT" => MessageType::Document,
        _ => MessageType::Text,
    }
}

fn action_type_str(t: ActionType) -> &'static str {
    match t {
        ActionType::Flow => "FLOW",
        ActionType::Webhook => "WEBHOOK",
        ActionType::Builtin => "BUILTIN",
    }
}

fn parse_action_type(s: &str) -> ActionType {
    match s {
        "WEBHOOK" => ActionType::Webhook,
        "BUILTIN" => ActionType::Builtin,
        _ => ActionType::Flow,
    }
}

fn step_type_str(t: StepType) -> &'static str {
    match t {
        StepType::Text => "TEXT",
        StepType::Image => "IMAGE",
        StepType::Audio => "AUDIO",
        StepType::Ptt => "PTT",
    }
}

fn parse_step_type(s: &str) -> StepType {
    match s {
        "IMAGE" => StepType::Image,
        "AUDIO" => StepType::Audio,
        "PTT" => StepType::Ptt,
        _ => StepType::Text,
    }
}

fn match_type_str(t: TriggerMatchType) -> &'static str {
    match t {
        TriggerMatchType::Contains => "contains",
        TriggerMatchType::Equals => "equals",
        TriggerMatchType::StartsWith => "starts_with",
        TriggerMatchType::Regex => "regex",
    }
}

fn parse_match_type(s: &str) -> TriggerMatchType {
    match s {
        "equals" => TriggerMatchType::Equals,
        "starts_with" => TriggerMatchType::StartsWith,
        "regex" => TriggerMatchType::Regex,
        _ => TriggerMatchType::Contains,
    }
}

fn scope_str(s: TriggerScope) -> &'static str {
    match s {
        TriggerScope::Incoming => "incoming",
        TriggerScope::Outgoing => "outgoing",
        TriggerScope::Both => "both",
    }
}

fn parse_scope(s: &str) -> TriggerScope {
    match s {
        "outgoing" => TriggerScope::Outgoing,
        "both" => TriggerScope::Both,
        _ => TriggerScope::Incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    #[test]
    fn session_get_or_create_is_idempotent() {
        let repo = repo();
        let a = repo.get_or_create_session("b1", "555", None, "whatsapp").unwrap();
        let b = repo.get_or_create_session("b1", "555", Some("ignored"), "whatsapp").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn message_upsert_dedups_by_external_id() {
        let repo = repo();
        let s = repo.get_or_create_session("b1", "555", None, "whatsapp").unwrap();
        let (m1, created1) = repo
            .upsert_inbound_message(&s.id, Some("e1"), "555", false, "hola", MessageType::Text, None)
            .unwrap();
        let (m2, created2) = repo
            .upsert_inbound_message(&s.id, Some("e1"), "555", false, "hola otra vez", MessageType::Text, None)
            .unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(m1.id, m2.id);
        assert_eq!(m2.content, "hola"); // original row, not the duplicate's content
    }

    #[test]
    fn tool_name_collision_is_already_exists() {
        let repo = repo();
        let schema = serde_json::json!({"type":"object"});
        repo.create_tool("b1", "get_labels", "x", &schema, ActionType::Builtin, &serde_json::json!({}), None).unwrap();
        let err = repo
            .create_tool("b1", "get_labels", "y", &schema, ActionType::Builtin, &serde_json::json!({}), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn sessions_by_label_excludes_ignored() {
        let repo = repo();
        let s1 = repo.get_or_create_session("b1", "a", None, "whatsapp").unwrap();
        let s2 = repo.get_or_create_session("b1", "b", None, "whatsapp").unwrap();
        let follow = repo.upsert_label("b1", "wa1", "FOLLOWUP").unwrap();
        let vip = repo.upsert_label("b1", "wa2", "VIP").unwrap();
        repo.assign_session_label(&s1.id, &follow.id).unwrap();
        repo.assign_session_label(&s2.id, &follow.id).unwrap();
        repo.assign_session_label(&s2.id, &vip.id).unwrap();

        let matches = repo.sessions_by_label("b1", "FOLLOWUP", &["VIP".to_string()]).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, s1.id);
    }

    #[test]
    fn client_register_lookup_and_credentials_roundtrip() {
        let repo = repo();
        repo.register_client("b1", "ABCD010101HDFLRN09", Some("5215512345678"), None).unwrap();
        let dup = repo.register_client("b1", "ABCD010101HDFLRN09", None, None).unwrap_err();
        assert!(matches!(dup, StoreError::AlreadyExists(_)));

        let found = repo.lookup_client("b1", "ABCD010101HDFLRN09").unwrap().unwrap();
        assert_eq!(found.phone.as_deref(), Some("5215512345678"));

        let updated = repo
            .save_client_credentials("b1", "ABCD010101HDFLRN09", &serde_json::json!({"portal_token": "x"}))
            .unwrap();
        assert_eq!(updated.credentials["portal_token"], "x");
    }
}
