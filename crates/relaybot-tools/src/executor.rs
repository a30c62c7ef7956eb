use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use relaybot_conversation::ConversationStore;
use relaybot_core::types::{self, ActionType, MessageType, StepType};
use relaybot_store::SqliteRepository;
use relaybot_transport::{OutboundPayload, QuotedContext, Transport};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::types::ToolCallResult;

const DEFAULT_TIMEZONE: &str = "America/Mexico_City";
const DEFAULT_LABEL_HISTORY: usize = 5;
const WEBHOOK_TIMEOUT_SECS: u64 = 15;

/// Scoped to one `processMessages` call: which session is this, and which
/// `reply_to_message` targets has it already answered (spec.md §4.4 / S3).
pub struct ToolContext {
    pub bot_id: String,
    pub session_id: String,
    pub identifier: String,
    replied_ids: Mutex<HashSet<String>>,
    sent_reply: std::sync::atomic::AtomicBool,
}

impl ToolContext {
    pub fn new(bot_id: impl Into<String>, session_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            session_id: session_id.into(),
            identifier: identifier.into(),
            replied_ids: Mutex::new(HashSet::new()),
            sent_reply: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn already_replied(&self, message_id: &str) -> bool {
        !self.replied_ids.lock().unwrap().insert(message_id.to_string())
    }

    /// Whether `reply_to_message` actually sent a quoted reply during this
    /// turn (as opposed to short-circuiting on a duplicate). The AI loop
    /// uses this to suppress the final direct send (spec.md §4.6 step h).
    pub fn did_send_reply(&self) -> bool {
        self.sent_reply.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Dispatches a model-requested tool call to FLOW / WEBHOOK / BUILTIN
/// handlers (spec.md §4.4). Every path is infallible from the model's point
/// of view — internal errors are folded into `ToolCallResult::fail`.
pub struct ToolExecutor {
    repo: Arc<SqliteRepository>,
    conversations: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    http: reqwest::Client,
}

impl ToolExecutor {
    pub fn new(
        repo: Arc<SqliteRepository>,
        conversations: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            repo,
            conversations,
            transport,
            http: reqwest::Client::new(),
        }
    }

    #[instrument(skip(self, ctx, arguments), fields(bot_id = %ctx.bot_id, name))]
    pub async fn execute(&self, ctx: &ToolContext, name: &str, arguments: &Value) -> ToolCallResult {
        if crate::builtin::is_builtin(name) {
            return self.dispatch_builtin(ctx, name, arguments).await;
        }

        let tool = match self.repo.get_active_tool(&ctx.bot_id, name) {
            Ok(Some(t)) => t,
            Ok(None) => return ToolCallResult::fail("tool not found or disabled"),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };

        match tool.action_type {
            ActionType::Flow => self.dispatch_flow(ctx, &tool, arguments).await,
            ActionType::Webhook => self.dispatch_webhook(ctx, &tool, arguments).await,
            ActionType::Builtin => self.dispatch_builtin(ctx, &tool.name, arguments).await,
        }
    }

    // -- FLOW ---------------------------------------------------------------

    async fn dispatch_flow(
        &self,
        ctx: &ToolContext,
        tool: &types::ToolRow,
        arguments: &Value,
    ) -> ToolCallResult {
        let Some(flow_id) = tool
            .flow_id
            .clone()
            .or_else(|| tool.action_config.get("flow_id").and_then(|v| v.as_str()).map(String::from))
        else {
            return ToolCallResult::fail("tool has no associated flow");
        };

        let flow = match self.repo.get_flow(&flow_id) {
            Ok(Some(f)) => f,
            Ok(None) => return ToolCallResult::fail("flow not found"),
            Err(e) => return ToolCallResult::fail(format!("flow lookup failed: {e}")),
        };

        let mut steps = flow.steps.clone();
        steps.sort_by_key(|s| s.order);
        for step in &steps {
            let content = step.content.as_ref().map(|c| substitute_placeholders(c, arguments));
            let payload = match step.step_type {
                StepType::Text => content.map(OutboundPayload::text),
                StepType::Image => Some(OutboundPayload::Image { url: step.media_url.clone().unwrap_or_default(), caption: content }),
                StepType::Audio => Some(OutboundPayload::Audio { url: step.media_url.clone().unwrap_or_default(), ptt: false }),
                StepType::Ptt => Some(OutboundPayload::Audio { url: step.media_url.clone().unwrap_or_default(), ptt: true }),
            };
            if let Some(payload) = payload {
                if let Err(e) = self.transport.send_message(&ctx.bot_id, &ctx.identifier, payload).await {
                    warn!(bot_id = %ctx.bot_id, flow = %flow.name, error = %e, "flow step transport error, continuing");
                }
            }
            if step.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
            }
        }

        ToolCallResult::ok(format!("ran flow '{}' ({} steps)", flow.name, steps.len()))
    }

    // -- WEBHOOK --------------------------------------------------------------

    async fn dispatch_webhook(
        &self,
        ctx: &ToolContext,
        tool: &types::ToolRow,
        arguments: &Value,
    ) -> ToolCallResult {
        let Some(url) = tool.action_config.get("url").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("webhook tool has no url configured");
        };
        let method = tool
            .action_config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST")
            .to_uppercase();

        let mut req = self
            .http
            .request(
                method.parse().unwrap_or(reqwest::Method::POST),
                url,
            )
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .header("Content-Type", "application/json");

        if method != "GET" {
            let mut body = arguments.clone();
            if let Value::Object(ref mut map) = body {
                map.insert("sessionId".into(), Value::String(ctx.session_id.clone()));
                map.insert("identifier".into(), Value::String(ctx.identifier.clone()));
            }
            req = req.json(&body);
        }

        match req.send().await {
            Ok(resp) => {
                let success = resp.status().is_success();
                let text = resp.text().await.unwrap_or_default();
                let data = serde_json::from_str::<Value>(&text)
                    .map(|v| v.to_string())
                    .unwrap_or(text);
                if success {
                    ToolCallResult::ok(data)
                } else {
                    ToolCallResult::fail(data)
                }
            }
            Err(e) => ToolCallResult::fail(format!("webhook request failed: {e}")),
        }
    }

    // -- BUILTIN --------------------------------------------------------------

    async fn dispatch_builtin(&self, ctx: &ToolContext, name: &str, args: &Value) -> ToolCallResult {
        match name {
            "get_current_time" => self.builtin_get_current_time(args),
            "clear_conversation" => self.builtin_clear_conversation(ctx),
            "get_labels" => self.builtin_get_labels(ctx),
            "assign_label" => self.builtin_assign_label(ctx, args).await,
            "remove_label" => self.builtin_remove_label(ctx, args).await,
            "get_sessions_by_label" => self.builtin_get_sessions_by_label(ctx, args),
            "reply_to_message" => self.builtin_reply_to_message(ctx, args).await,
            "send_followup_message" => self.builtin_send_followup_message(ctx, args).await,
            "lookup_client" => self.builtin_lookup_client(ctx, args),
            "register_client" => self.builtin_register_client(ctx, args),
            "save_credentials" => self.builtin_save_credentials(ctx, args),
            other => ToolCallResult::fail(format!("unknown builtin tool '{other}'")),
        }
    }

    fn builtin_get_current_time(&self, args: &Value) -> ToolCallResult {
        let tz_name = args.get("timezone").and_then(|v| v.as_str()).unwrap_or(DEFAULT_TIMEZONE);
        let tz: Tz = match tz_name.parse() {
            Ok(tz) => tz,
            Err(_) => return ToolCallResult::fail(format!("unknown timezone '{tz_name}'")),
        };
        ToolCallResult::ok(Utc::now().with_timezone(&tz).to_rfc3339())
    }

    fn builtin_clear_conversation(&self, ctx: &ToolContext) -> ToolCallResult {
        match self.conversations.clear(&ctx.session_id) {
            Ok(()) => ToolCallResult::ok("conversation cleared"),
            Err(e) => ToolCallResult::fail(format!("clear failed: {e}")),
        }
    }

    fn builtin_get_labels(&self, ctx: &ToolContext) -> ToolCallResult {
        match self.repo.labels_for_bot(&ctx.bot_id) {
            Ok(labels) => {
                let mut lines = Vec::new();
                for l in labels {
                    let count = self.repo.session_count_for_label(&l.id).unwrap_or(0);
                    lines.push(format!("{}: {} sessions", l.name, count));
                }
                ToolCallResult::ok(lines.join("\n"))
            }
            Err(e) => ToolCallResult::fail(format!("lookup failed: {e}")),
        }
    }

    async fn builtin_assign_label(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(name) = args.get("label").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'label' argument");
        };
        let label = match self.repo.get_label_by_name(&ctx.bot_id, name) {
            Ok(Some(l)) => l,
            Ok(None) => return ToolCallResult::fail(format!("no such label '{name}'")),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        if let Err(e) = self.transport.add_chat_label(&ctx.bot_id, &ctx.identifier, &label.wa_label_id).await {
            warn!(bot_id = %ctx.bot_id, error = %e, "transport add_chat_label failed, persisting anyway");
        }
        match self.repo.assign_session_label(&ctx.session_id, &label.id) {
            Ok(()) => ToolCallResult::ok(format!("assigned label '{name}'")),
            Err(e) => ToolCallResult::fail(format!("persist failed: {e}")),
        }
    }

    async fn builtin_remove_label(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(name) = args.get("label").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'label' argument");
        };
        let label = match self.repo.get_label_by_name(&ctx.bot_id, name) {
            Ok(Some(l)) => l,
            Ok(None) => return ToolCallResult::fail(format!("no such label '{name}'")),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        if let Err(e) = self.transport.remove_chat_label(&ctx.bot_id, &ctx.identifier, &label.wa_label_id).await {
            warn!(bot_id = %ctx.bot_id, error = %e, "transport remove_chat_label failed, persisting anyway");
        }
        match self.repo.remove_session_label(&ctx.session_id, &label.id) {
            Ok(()) => ToolCallResult::ok(format!("removed label '{name}'")),
            Err(e) => ToolCallResult::fail(format!("persist failed: {e}")),
        }
    }

    fn builtin_get_sessions_by_label(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(name) = args.get("label").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'label' argument");
        };
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_LABEL_HISTORY as u64) as usize;
        let bot = match self.repo.get_bot(&ctx.bot_id) {
            Ok(Some(b)) => b,
            Ok(None) => return ToolCallResult::fail("bot not found"),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        let sessions = match self.repo.sessions_by_label(&ctx.bot_id, name, &bot.ignored_labels) {
            Ok(s) => s,
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };

        let mut out = Vec::new();
        for s in sessions {
            let history = self.conversations.history(&s.id).unwrap_or_default();
            let recent: Vec<String> = history
                .iter()
                .rev()
                .take(limit)
                .rev()
                .map(|t| format!("{}: {}", t.role, t.content.clone().unwrap_or_default()))
                .collect();
            out.push(format!("{} ({})\n{}", s.identifier, s.id, recent.join("\n")));
        }
        ToolCallResult::ok(out.join("\n---\n"))
    }

    async fn builtin_reply_to_message(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(message_id) = args.get("message_id").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'message_id' argument");
        };
        let Some(text) = args.get("text").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'text' argument");
        };

        if ctx.already_replied(message_id) {
            return ToolCallResult::ok(crate::types::REPLY_ALREADY_HANDLED_MESSAGE);
        }

        let quoted = match self.repo.get_message_by_external_id(message_id) {
            Ok(Some(m)) => m,
            Ok(None) => return ToolCallResult::fail("quoted message not found"),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        let owning_session = match self.repo.get_session_by_id(&quoted.session_id) {
            Ok(Some(s)) => s,
            Ok(None) => return ToolCallResult::fail("quoted message's session no longer exists"),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        if owning_session.bot_id != ctx.bot_id {
            return ToolCallResult::fail("quoted message does not belong to this bot");
        }

        let payload = OutboundPayload::Quoted {
            text: text.to_string(),
            context: QuotedContext {
                stanza_id: message_id.to_string(),
                participant: quoted.sender.clone(),
                quoted_conversation: quoted.content.clone(),
            },
        };
        match self.transport.send_message(&ctx.bot_id, &ctx.identifier, payload).await {
            Ok(()) => {
                ctx.sent_reply.store(true, std::sync::atomic::Ordering::Relaxed);
                ToolCallResult::ok(format!("replied to message {message_id}"))
            }
            Err(e) => ToolCallResult::fail(format!("send failed: {e}")),
        }
    }

    async fn builtin_send_followup_message(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(identifier) = args.get("identifier").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'identifier' argument");
        };
        let Some(text) = args.get("text").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'text' argument");
        };
        let session = match self.repo.get_session(&ctx.bot_id, identifier) {
            Ok(Some(s)) => s,
            Ok(None) => return ToolCallResult::fail("target session not found for this bot"),
            Err(e) => return ToolCallResult::fail(format!("lookup failed: {e}")),
        };
        if let Err(e) = self.transport.send_message(&ctx.bot_id, identifier, OutboundPayload::text(text)).await {
            return ToolCallResult::fail(format!("send failed: {e}"));
        }
        match self.repo.upsert_inbound_message(&session.id, None, "bot", true, text, MessageType::Text, None) {
            Ok(_) => ToolCallResult::ok(format!("sent followup to {identifier}")),
            Err(e) => ToolCallResult::fail(format!("persist failed: {e}")),
        }
    }

    fn builtin_lookup_client(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(curp) = args.get("curp").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'curp' argument");
        };
        if !types::is_valid_curp(curp) {
            return ToolCallResult::fail("curp must be 18 alphanumeric characters");
        }
        match self.repo.lookup_client(&ctx.bot_id, curp) {
            Ok(Some(c)) => ToolCallResult::ok(serde_json::to_string(&c).unwrap_or_default()),
            Ok(None) => ToolCallResult::fail("client not found"),
            Err(e) => ToolCallResult::fail(format!("lookup failed: {e}")),
        }
    }

    fn builtin_register_client(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(curp) = args.get("curp").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'curp' argument");
        };
        if !types::is_valid_curp(curp) {
            return ToolCallResult::fail("curp must be 18 alphanumeric characters");
        }
        let phone = args.get("phone").and_then(|v| v.as_str());
        if let Some(p) = phone {
            if !types::is_valid_phone(p) {
                return ToolCallResult::fail("phone must be 10-15 digits");
            }
        }
        let email = args.get("email").and_then(|v| v.as_str());
        if let Some(e) = email {
            if !types::is_valid_email(e) {
                return ToolCallResult::fail("email is not a valid address");
            }
        }
        match self.repo.register_client(&ctx.bot_id, curp, phone, email) {
            Ok(c) => ToolCallResult::ok(serde_json::to_string(&c).unwrap_or_default()),
            Err(e) => ToolCallResult::fail(format!("register failed: {e}")),
        }
    }

    fn builtin_save_credentials(&self, ctx: &ToolContext, args: &Value) -> ToolCallResult {
        let Some(curp) = args.get("curp").and_then(|v| v.as_str()) else {
            return ToolCallResult::fail("missing 'curp' argument");
        };
        let Some(credentials) = args.get("credentials") else {
            return ToolCallResult::fail("missing 'credentials' argument");
        };
        match self.repo.save_client_credentials(&ctx.bot_id, curp, credentials) {
            Ok(c) => ToolCallResult::ok(serde_json::to_string(&c).unwrap_or_default()),
            Err(e) => ToolCallResult::fail(format!("save failed: {e}")),
        }
    }
}

/// Replace every `{{key}}` in `content` with `String(arguments[key])`.
fn substitute_placeholders(content: &str, arguments: &Value) -> String {
    let mut out = content.to_string();
    if let Value::Object(map) = arguments {
        for (key, value) in map {
            let needle = format!("{{{{{key}}}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &replacement);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_transport::FakeTransport;
    use rusqlite::Connection;

    fn executor() -> (ToolExecutor, Arc<SqliteRepository>, Arc<FakeTransport>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let conv = Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap(), 100, 300, 30).unwrap());
        let transport = Arc::new(FakeTransport::new());
        (ToolExecutor::new(repo.clone(), conv, transport.clone()), repo, transport)
    }

    #[tokio::test]
    async fn reply_to_message_dedups_second_call() {
        let (exec, repo, transport) = executor();
        let session = repo.get_or_create_session("b1", "555", None, "whatsapp").unwrap();
        repo.upsert_inbound_message(&session.id, Some("e1"), "555", false, "hola", MessageType::Text, None).unwrap();

        let ctx = ToolContext::new("b1", &session.id, "555");
        let args = serde_json::json!({"message_id": "e1", "text": "hi"});
        let first = exec.execute(&ctx, "reply_to_message", &args).await;
        assert!(first.success);
        let second = exec.execute(&ctx, "reply_to_message", &args).await;
        assert!(second.data.contains("Ya respondiste"));
        assert_eq!(transport.sent_to("b1", "555").len(), 1);
    }

    #[tokio::test]
    async fn reply_to_message_rejects_cross_bot_quote() {
        let (exec, repo, _transport) = executor();
        let session = repo.get_or_create_session("b1", "555", None, "whatsapp").unwrap();
        repo.upsert_inbound_message(&session.id, Some("e1"), "555", false, "hola", MessageType::Text, None).unwrap();

        let ctx = ToolContext::new("b2", "other-session", "999");
        let args = serde_json::json!({"message_id": "e1", "text": "hi"});
        let result = exec.execute(&ctx, "reply_to_message", &args).await;
        assert!(!result.success);
    }

    #[test]
    fn substitutes_multiple_placeholders() {
        let args = serde_json::json!({"name": "Ana", "count": 3});
        assert_eq!(
            substitute_placeholders("Hola {{name}}, tienes {{count}} mensajes", &args),
            "Hola Ana, tienes 3 mensajes"
        );
    }

    #[tokio::test]
    async fn register_client_rejects_invalid_curp() {
        let (exec, _repo, _t) = executor();
        let ctx = ToolContext::new("b1", "s1", "555");
        let args = serde_json::json!({"curp": "too-short"});
        let result = exec.execute(&ctx, "register_client", &args).await;
        assert!(!result.success);
    }
}
