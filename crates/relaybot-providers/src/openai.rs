use relaybot_core::types::{ConversationTurn, Role, ToolCallRef};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::LlmProvider;
use crate::types::{ChatRequest, ChatResponse, ToolSpec, Usage};

const CHAT_TIMEOUT_SECS: u64 = 120;

/// Provider B ("OpenAI-style") — tool calls are carried natively, no
/// `thoughtSignature` bookkeeping (spec.md §4.5).
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = build_request_body(req);
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %req.model, "sending request to openai");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "openai api error");
            return Err(ProviderError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(turn_to_openai_message).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature,
    });

    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(req.tools.iter().map(tool_spec_to_openai).collect::<Vec<_>>());
    }
    body
}

fn tool_spec_to_openai(t: &ToolSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters_schema,
        }
    })
}

fn turn_to_openai_message(turn: &ConversationTurn) -> serde_json::Value {
    match turn.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id,
            "content": turn.content,
        }),
        Role::Assistant if !turn.tool_calls.is_empty() => serde_json::json!({
            "role": "assistant",
            "content": turn.content,
            "tool_calls": turn.tool_calls.iter().map(|c| serde_json::json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments.to_string()},
            })).collect::<Vec<_>>(),
        }),
        _ => serde_json::json!({"role": turn.role.to_string(), "content": turn.content}),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let message = resp.choices.into_iter().next().map(|c| c.message);
    let tool_calls = message
        .as_ref()
        .map(|m| {
            m.tool_calls
                .iter()
                .map(|c| ToolCallRef {
                    id: c.id.clone(),
                    name: c.function.name.clone(),
                    arguments: serde_json::from_str(&c.function.arguments).unwrap_or(serde_json::Value::Null),
                    thought_signature: None,
                })
                .collect()
        })
        .unwrap_or_default();

    ChatResponse {
        content: message.and_then(|m| m.content),
        tool_calls,
        usage: resp.usage.map(|u| Usage { tokens_in: u.prompt_tokens, tokens_out: u.completion_tokens }),
        used_fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_turn_with_tool_calls_serialises_natively() {
        let turn = ConversationTurn::assistant(
            Some("checking".into()),
            vec![ToolCallRef { id: "c1".into(), name: "get_current_time".into(), arguments: serde_json::json!({}), thought_signature: None }],
        );
        let msg = turn_to_openai_message(&turn);
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_current_time");
    }

    #[test]
    fn parses_tool_calls_from_response() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "get_current_time", "arguments": "{}"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let api_resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(api_resp);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.usage.unwrap().tokens_in, 10);
    }
}
