use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection};
use tracing::{debug, instrument, warn};

use relaybot_core::types::{ConversationTurn, Role, ToolCallRef};

use crate::db::init_db;
use crate::error::Result;

struct CachedSession {
    turns: VecDeque<ConversationTurn>,
    expires_at: Instant,
}

/// Cache + durable log of AI turn history, with reconstruction on cache miss
/// (spec.md §4.2). The cache is process-local; ordering within a session is
/// strictly monotonic by `created_at`.
pub struct ConversationStore {
    cache: DashMap<String, CachedSession>,
    db: Mutex<Connection>,
    max_messages: usize,
    ttl: Duration,
    pg_history_days: i64,
}

impl ConversationStore {
    pub fn new(
        conn: Connection,
        max_messages: usize,
        ttl_secs: u64,
        pg_history_days: i64,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            cache: DashMap::new(),
            db: Mutex::new(conn),
            max_messages,
            ttl: Duration::from_secs(ttl_secs),
            pg_history_days,
        })
    }

    /// Cache write always happens; a durable-log failure is logged and
    /// swallowed rather than propagated (spec.md §4.2, §7: the fast cache
    /// remains authoritative for the turn even if SQLite is unavailable).
    #[instrument(skip(self, turn), fields(session_id))]
    pub fn append(&self, session_id: &str, turn: ConversationTurn) -> Result<()> {
        self.push_cache(session_id, std::iter::once(turn.clone()));
        if let Err(e) = self.persist(session_id, std::slice::from_ref(&turn)) {
            warn!(session_id, error = %e, "durable conversation log write failed, cache remains authoritative");
        }
        Ok(())
    }

    /// Atomic on the fast cache (one push for the whole batch); the durable
    /// write is a plain loop, not wrapped in the same transaction, and a
    /// failure there is logged and swallowed (see `append`).
    pub fn append_many(&self, session_id: &str, turns: Vec<ConversationTurn>) -> Result<()> {
        self.push_cache(session_id, turns.clone().into_iter());
        if let Err(e) = self.persist(session_id, &turns) {
            warn!(session_id, error = %e, "durable conversation log write failed, cache remains authoritative");
        }
        Ok(())
    }

    /// Oldest→newest. Reconstructs from the durable store on a cache miss,
    /// rehydrating the cache before returning (spec.md §4.2 `history()`).
    #[instrument(skip(self), fields(session_id))]
    pub fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        if let Some(entry) = self.cache.get(session_id) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.turns.iter().cloned().collect());
            }
        }

        debug!(session_id, "conversation cache miss, reconstructing from durable store");
        let turns = self.reconstruct(session_id)?;
        self.cache.insert(
            session_id.to_string(),
            CachedSession {
                turns: turns.clone().into(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(turns)
    }

    /// Best-effort durable-log metadata update tagging the assistant turns
    /// appended during one AI turn with the model + token count actually
    /// used (spec.md §4.6 step i). `created_ats` identifies the rows by the
    /// timestamp they were appended with; a failure here is logged and
    /// swallowed, it never invalidates the turn that already completed.
    #[instrument(skip(self, created_ats), fields(session_id))]
    pub fn tag_assistant_turns(&self, session_id: &str, created_ats: &[String], model: &str, token_count: u32) {
        if created_ats.is_empty() {
            return;
        }
        let db = self.db.lock().unwrap();
        for created_at in created_ats {
            if let Err(e) = db.execute(
                "UPDATE conversation_turns SET model = ?1, token_count = ?2
                 WHERE session_id = ?3 AND created_at = ?4 AND role = 'assistant'",
                params![model, token_count, session_id, created_at],
            ) {
                warn!(session_id, created_at, error = %e, "failed to tag assistant turn with model/token metadata");
            }
        }
    }

    pub fn clear(&self, session_id: &str) -> Result<()> {
        self.cache.remove(session_id);
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM conversation_turns WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Fast-cache presence check only — a durable-only session reports `false`
    /// until something calls `history()` to rehydrate it.
    pub fn has(&self, session_id: &str) -> bool {
        self.cache
            .get(session_id)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn push_cache(&self, session_id: &str, turns: impl Iterator<Item = ConversationTurn>) {
        let mut entry = self.cache.entry(session_id.to_string()).or_insert_with(|| CachedSession {
            turns: VecDeque::new(),
            expires_at: Instant::now() + self.ttl,
        });
        entry.turns.extend(turns);
        while entry.turns.len() > self.max_messages {
            entry.turns.pop_front();
        }
        entry.expires_at = Instant::now() + self.ttl;
    }

    fn persist(&self, session_id: &str, turns: &[ConversationTurn]) -> Result<()> {
        let db = self.db.lock().unwrap();
        for turn in turns {
            let tool_calls_json = if turn.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&turn.tool_calls)?)
            };
            db.execute(
                "INSERT INTO conversation_turns
                 (session_id, role, content, tool_calls, tool_call_id, tool_name, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    session_id,
                    turn.role.to_string(),
                    turn.content,
                    tool_calls_json,
                    turn.tool_call_id,
                    turn.tool_name,
                    turn.created_at,
                ],
            )?;
        }
        Ok(())
    }

    /// Filters by `created_at >= now - pg_history_days`, caps at
    /// `max_messages`, collapses tool-role turns into synthetic assistant
    /// text so no reconstructed history carries a dangling `toolCallId`.
    fn reconstruct(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let cutoff = (Utc::now() - chrono::Duration::days(self.pg_history_days)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT role, content, tool_calls, tool_call_id, tool_name, created_at
             FROM conversation_turns
             WHERE session_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![session_id, cutoff, self.max_messages as i64],
            |row| {
                let role_str: String = row.get(0)?;
                let tool_calls_json: Option<String> = row.get(2)?;
                Ok((
                    role_str,
                    row.get::<_, Option<String>>(1)?,
                    tool_calls_json,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows.filter_map(|r| r.ok()) {
            let (role_str, content, tool_calls_json, tool_call_id, tool_name, created_at) = row;
            let role: Role = role_str.parse().unwrap_or(Role::User);
            if role == Role::Tool {
                let name = tool_name.as_deref().unwrap_or("tool");
                let result = content.as_deref().unwrap_or("");
                out.push(ConversationTurn {
                    role: Role::Assistant,
                    content: Some(format!("[Previous tool: {name} → {result}]")),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    tool_name: None,
                    created_at,
                });
                continue;
            }
            let tool_calls: Vec<ToolCallRef> = tool_calls_json
                .map(|s| serde_json::from_str(&s).unwrap_or_default())
                .unwrap_or_default();
            out.push(ConversationTurn {
                role,
                content,
                tool_calls,
                tool_call_id,
                tool_name,
                created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::new(Connection::open_in_memory().unwrap(), 3, 300, 30).unwrap()
    }

    #[test]
    fn append_then_history_returns_appended_turn_last() {
        let s = store();
        s.append("sess1", ConversationTurn::user("hi")).unwrap();
        s.append("sess1", ConversationTurn::assistant(Some("hello".into()), vec![])).unwrap();
        let h = s.history("sess1").unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.last().unwrap().content.as_deref(), Some("hello"));
    }

    #[test]
    fn rolling_cap_trims_oldest_on_cache() {
        let s = store();
        for i in 0..5 {
            s.append("sess1", ConversationTurn::user(format!("msg{i}"))).unwrap();
        }
        let h = s.history("sess1").unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.first().unwrap().content.as_deref(), Some("msg2"));
    }

    #[test]
    fn clear_then_has_returns_false() {
        let s = store();
        s.append("sess1", ConversationTurn::user("hi")).unwrap();
        assert!(s.has("sess1"));
        s.clear("sess1").unwrap();
        assert!(!s.has("sess1"));
    }

    #[test]
    fn reconstruction_collapses_tool_turns() {
        let s = store();
        s.append("sess1", ConversationTurn::user("what time is it?")).unwrap();
        s.append(
            "sess1",
            ConversationTurn::tool("call1", "get_current_time", "2026-08-01T00:00:00Z"),
        )
        .unwrap();
        s.cache.remove("sess1"); // force a durable-store reconstruction
        let h = s.history("sess1").unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[1].role, Role::Assistant);
        assert!(h[1].content.as_ref().unwrap().starts_with("[Previous tool: get_current_time"));
    }

    #[test]
    fn tag_assistant_turns_sets_model_and_token_count() {
        let s = store();
        let turn = ConversationTurn::assistant(Some("hola".into()), vec![]);
        let created_at = turn.created_at.clone();
        s.append("sess1", turn).unwrap();

        s.tag_assistant_turns("sess1", &[created_at.clone()], "gemini-2.5-flash", 42);

        let db = s.db.lock().unwrap();
        let (model, tokens): (String, i64) = db
            .query_row(
                "SELECT model, token_count FROM conversation_turns WHERE session_id = ?1 AND created_at = ?2",
                params!["sess1", created_at],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(model, "gemini-2.5-flash");
        assert_eq!(tokens, 42);
    }

    #[test]
    fn tag_assistant_turns_with_no_stamps_is_a_noop() {
        let s = store();
        s.append("sess1", ConversationTurn::user("hi")).unwrap();
        s.tag_assistant_turns("sess1", &[], "gemini-2.5-flash", 10);
    }
}
