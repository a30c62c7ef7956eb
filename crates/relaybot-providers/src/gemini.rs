use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relaybot_core::types::{ConversationTurn, Role, ToolCallRef};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::LlmProvider;
use crate::types::{ChatRequest, ChatResponse, ToolSpec, Usage};

const CHAT_TIMEOUT_SECS: u64 = 120;
const CACHE_CREATE_TIMEOUT_SECS: u64 = 15;
const CACHE_TOKEN_THRESHOLD: usize = 4096;
const CACHE_MIN_REMAINING_TTL_SECS: u64 = 60;
const CACHE_TTL_SECS: u64 = 3600;

struct CacheEntry {
    name: String,
    expires_at: Instant,
}

/// Provider A ("Gemini-style") — carries an opaque `thoughtSignature` on
/// tool calls and supports an explicit system-prompt cache (spec.md §4.5).
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    cache_registry: DashMap<String, CacheEntry>,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            cache_registry: DashMap::new(),
        }
    }

    fn estimate_tokens(text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }

    fn cache_key(model: &str, system_prompt: &str, tools: &[ToolSpec]) -> String {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        system_prompt.hash(&mut hasher);
        for t in tools {
            t.name.hash(&mut hasher);
            t.description.hash(&mut hasher);
        }
        format!("{:x}", hasher.finish())
    }

    /// Reuse a live cache entry or attempt to create one. Returns `None` on
    /// any failure, which the caller treats as "fall back to inline system
    /// prompt" (spec.md §4.5: cache creation failure degrades silently).
    async fn resolve_cache(&self, model: &str, system_prompt: &str, tools: &[ToolSpec]) -> Option<String> {
        let key = Self::cache_key(model, system_prompt, tools);

        if let Some(entry) = self.cache_registry.get(&key) {
            let remaining = entry.expires_at.saturating_duration_since(Instant::now());
            if remaining >= Duration::from_secs(CACHE_MIN_REMAINING_TTL_SECS) {
                return Some(entry.name.clone());
            }
        }

        let body = json!({
            "model": format!("models/{model}"),
            "contents": [{"role": "user", "parts": [{"text": system_prompt}]}],
            "ttl": format!("{CACHE_TTL_SECS}s"),
        });
        let url = format!("{}/v1beta/cachedContents?key={}", self.base_url, self.api_key);

        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(CACHE_CREATE_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "gemini cache creation rejected, degrading to inline system prompt");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "gemini cache creation failed, degrading to inline system prompt");
                return None;
            }
        };

        let v: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return None,
        };
        let name = v.get("name").and_then(|n| n.as_str())?.to_string();
        self.cache_registry.insert(
            key,
            CacheEntry { name: name.clone(), expires_at: Instant::now() + Duration::from_secs(CACHE_TTL_SECS) },
        );
        Some(name)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let system_prompt = req
            .messages
            .iter()
            .find(|t| t.role == Role::System)
            .and_then(|t| t.content.clone())
            .unwrap_or_default();

        let tool_defs_text: String =
            req.tools.iter().map(|t| format!("{}{}", t.name, t.parameters_schema)).collect();
        let estimate = Self::estimate_tokens(&system_prompt) + Self::estimate_tokens(&tool_defs_text);

        let cached_content = if estimate > CACHE_TOKEN_THRESHOLD && !system_prompt.is_empty() {
            self.resolve_cache(&req.model, &system_prompt, &req.tools).await
        } else {
            None
        };

        let downgraded = downgrade_unsigned_tool_calls(&req.messages);
        let contents: Vec<Value> = downgraded
            .iter()
            .filter(|t| t.role != Role::System)
            .map(turn_to_gemini_content)
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": { "temperature": req.temperature },
        });

        if let Some(name) = &cached_content {
            body["cachedContent"] = json!(name);
        } else if !system_prompt.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_prompt}]});
        }

        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "parameters": t.parameters_schema}))
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, req.model, self.api_key
        );
        debug!(model = %req.model, cached = cached_content.is_some(), "sending request to gemini");

        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "gemini api error");
            return Err(ProviderError::Api { status, message: text });
        }

        let v: Value = resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_response(&v)
    }
}

/// Collapses assistant tool-call turns that lack a `thoughtSignature` (and
/// their paired tool-result turns) into synthetic assistant text, mirroring
/// the reconstruction collapse used by the conversation store.
fn downgrade_unsigned_tool_calls(messages: &[ConversationTurn]) -> Vec<ConversationTurn> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let turn = &messages[i];
        let unsigned = turn.role == Role::Assistant
            && !turn.tool_calls.is_empty()
            && turn.tool_calls.iter().any(|c| c.thought_signature.is_none());

        if !unsigned {
            out.push(turn.clone());
            i += 1;
            continue;
        }

        let call_ids: Vec<&str> = turn.tool_calls.iter().map(|c| c.id.as_str()).collect();
        let mut summary = turn.content.clone().unwrap_or_default();
        let mut j = i + 1;
        while j < messages.len() {
            let next = &messages[j];
            let matches = next.role == Role::Tool
                && next.tool_call_id.as_deref().map(|id| call_ids.contains(&id)).unwrap_or(false);
            if !matches {
                break;
            }
            let name = next.tool_name.as_deref().unwrap_or("tool");
            let result = next.content.as_deref().unwrap_or("");
            summary.push_str(&format!("\n[Previous tool: {name} → {result}]"));
            j += 1;
        }

        out.push(ConversationTurn {
            role: Role::Assistant,
            content: Some(summary),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            created_at: turn.created_at.clone(),
        });
        i = j;
    }
    out
}

fn turn_to_gemini_content(turn: &ConversationTurn) -> Value {
    match turn.role {
        Role::Tool => json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": turn.tool_name.clone().unwrap_or_default(),
                    "response": {"output": turn.content.clone().unwrap_or_default()},
                }
            }]
        }),
        Role::Assistant if !turn.tool_calls.is_empty() => {
            let parts: Vec<Value> = turn
                .tool_calls
                .iter()
                .map(|c| {
                    let mut part = json!({"functionCall": {"name": c.name, "args": c.arguments}});
                    if let Some(sig) = &c.thought_signature {
                        part["thoughtSignature"] = json!(sig);
                    }
                    part
                })
                .collect();
            json!({"role": "model", "parts": parts})
        }
        Role::Assistant => {
            json!({"role": "model", "parts": [{"text": turn.content.clone().unwrap_or_default()}]})
        }
        _ => json!({"role": "user", "parts": [{"text": turn.content.clone().unwrap_or_default()}]}),
    }
}

fn parse_response(v: &Value) -> Result<ChatResponse> {
    let usage = v.get("usageMetadata").map(|m| Usage {
        tokens_in: m["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        tokens_out: m["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    });

    let parts = v["candidates"][0]["content"]["parts"].as_array().cloned().unwrap_or_default();
    let mut content = None;
    let mut tool_calls = Vec::new();

    for part in &parts {
        if let Some(fc) = part.get("functionCall") {
            tool_calls.push(ToolCallRef {
                id: fc["name"].as_str().unwrap_or_default().to_string(),
                name: fc["name"].as_str().unwrap_or_default().to_string(),
                arguments: fc.get("args").cloned().unwrap_or(Value::Null),
                thought_signature: part.get("thoughtSignature").and_then(|s| s.as_str()).map(String::from),
            });
        } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            content = Some(text.to_string());
        }
    }

    Ok(ChatResponse { content, tool_calls, usage, used_fallback: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_tool_call_and_its_result_collapse_to_text() {
        let messages = vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant(
                Some("checking".into()),
                vec![ToolCallRef { id: "c1".into(), name: "t".into(), arguments: json!({}), thought_signature: None }],
            ),
            ConversationTurn::tool("c1", "t", "r"),
            ConversationTurn::user("next"),
        ];
        let downgraded = downgrade_unsigned_tool_calls(&messages);
        assert_eq!(downgraded.len(), 3);
        assert_eq!(downgraded[1].role, Role::Assistant);
        assert!(downgraded[1].tool_calls.is_empty());
        assert!(downgraded[1].content.as_ref().unwrap().contains("[Previous tool: t → r]"));
    }

    #[test]
    fn signed_tool_call_is_preserved() {
        let messages = vec![ConversationTurn::assistant(
            None,
            vec![ToolCallRef { id: "c1".into(), name: "t".into(), arguments: json!({}), thought_signature: Some("sig".into()) }],
        )];
        let downgraded = downgrade_unsigned_tool_calls(&messages);
        assert_eq!(downgraded.len(), 1);
        assert_eq!(downgraded[0].tool_calls.len(), 1);
    }

    #[test]
    fn cache_key_is_stable_for_same_inputs() {
        let tools = vec![ToolSpec { name: "a".into(), description: "d".into(), parameters_schema: json!({}) }];
        let k1 = GeminiProvider::cache_key("gemini-2.0", "prompt", &tools);
        let k2 = GeminiProvider::cache_key("gemini-2.0", "prompt", &tools);
        assert_eq!(k1, k2);
    }

    #[test]
    fn parses_function_call_with_thought_signature() {
        let v = json!({
            "candidates": [{"content": {"parts": [{
                "functionCall": {"name": "get_current_time", "args": {}},
                "thoughtSignature": "sig-123",
            }]}}],
            "usageMetadata": {"promptTokenCount": 20, "candidatesTokenCount": 4},
        });
        let resp = parse_response(&v).unwrap();
        assert_eq!(resp.tool_calls[0].thought_signature.as_deref(), Some("sig-123"));
        assert_eq!(resp.usage.unwrap().tokens_in, 20);
    }
}
