use std::collections::HashMap;
use std::sync::Arc;

use relaybot_core::config::FailoverTarget;
use relaybot_core::types::ProviderKind;
use tracing::warn;

use crate::error::Result;
use crate::provider::LlmProvider;
use crate::types::ChatRequest;

/// Adapts a primary provider call with a single pinned fallback hop
/// (spec.md §4.6.1). Unlike an N-slot retry chain, this tries the primary
/// exactly once and the configured fallback exactly once; it never walks a
/// longer priority list.
pub struct ProviderRouter {
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
    failover: HashMap<ProviderKind, FailoverTarget>,
}

impl ProviderRouter {
    pub fn new(providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>, failover: HashMap<ProviderKind, FailoverTarget>) -> Self {
        Self { providers, failover }
    }

    /// Calls `provider` directly, skipping the failover lookup entirely.
    /// Used once a turn has already pinned a fallback provider (spec.md
    /// §4.6.1: "no flapping inside one tool loop").
    pub async fn chat_direct(&self, provider: ProviderKind, req: &ChatRequest) -> Result<crate::types::ChatResponse> {
        let provider_impl = self.providers.get(&provider).ok_or_else(|| {
            crate::error::ProviderError::Unavailable(format!("no provider registered for {provider}"))
        })?;
        provider_impl.chat(req).await
    }

    /// Calls `primary` with `req`. On any error, consults the failover
    /// mapping and retries once against the fallback provider/model with the
    /// same messages and tools. If the fallback also fails, the *original*
    /// error from the primary is returned. On success via fallback, the
    /// response's `used_fallback` flag is set so the caller can pin the
    /// fallback provider for the rest of the turn.
    pub async fn chat(&self, primary: ProviderKind, req: &ChatRequest) -> Result<crate::types::ChatResponse> {
        let provider = self.providers.get(&primary).ok_or_else(|| {
            crate::error::ProviderError::Unavailable(format!("no provider registered for {primary}"))
        })?;

        match provider.chat(req).await {
            Ok(resp) => Ok(resp),
            Err(primary_err) => {
                let Some(target) = self.failover.get(&primary) else {
                    return Err(primary_err);
                };
                let Some(fallback_provider) = self.providers.get(&target.provider) else {
                    return Err(primary_err);
                };

                warn!(primary = %primary, fallback = %target.provider, error = %primary_err, "primary provider failed, trying fallback");

                let mut fallback_req = req.clone();
                fallback_req.model = target.model.clone();

                match fallback_provider.chat(&fallback_req).await {
                    Ok(mut resp) => {
                        resp.used_fallback = true;
                        Ok(resp)
                    }
                    Err(_fallback_err) => Err(primary_err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatResponse, Usage};
    use async_trait::async_trait;
    use relaybot_core::types::ConversationTurn;

    struct AlwaysFails;
    #[async_trait]
    impl LlmProvider for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Err(crate::error::ProviderError::RateLimited)
        }
    }

    struct AlwaysOk;
    #[async_trait]
    impl LlmProvider for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse { content: Some("ok".into()), tool_calls: vec![], usage: Some(Usage::default()), used_fallback: false })
        }
    }

    fn req() -> ChatRequest {
        ChatRequest {
            model: "primary-model".into(),
            messages: vec![ConversationTurn::user("hi")],
            tools: vec![],
            temperature: 0.5,
            thinking_level: None,
        }
    }

    #[tokio::test]
    async fn falls_back_and_pins_when_primary_errors() {
        let mut providers: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(ProviderKind::Gemini, Arc::new(AlwaysFails));
        providers.insert(ProviderKind::OpenAi, Arc::new(AlwaysOk));
        let mut failover = HashMap::new();
        failover.insert(ProviderKind::Gemini, FailoverTarget { provider: ProviderKind::OpenAi, model: "gpt-4o-mini".into() });

        let router = ProviderRouter::new(providers, failover);
        let resp = router.chat(ProviderKind::Gemini, &req()).await.unwrap();
        assert!(resp.used_fallback);
        assert_eq!(resp.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn returns_original_error_when_both_fail() {
        let mut providers: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(ProviderKind::Gemini, Arc::new(AlwaysFails));
        providers.insert(ProviderKind::OpenAi, Arc::new(AlwaysFails));
        let mut failover = HashMap::new();
        failover.insert(ProviderKind::Gemini, FailoverTarget { provider: ProviderKind::OpenAi, model: "gpt-4o-mini".into() });

        let router = ProviderRouter::new(providers, failover);
        let err = router.chat(ProviderKind::Gemini, &req()).await.unwrap_err();
        assert!(matches!(err, crate::error::ProviderError::RateLimited));
    }

    #[tokio::test]
    async fn no_failover_mapping_propagates_primary_error() {
        let mut providers: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(ProviderKind::Gemini, Arc::new(AlwaysFails));
        let router = ProviderRouter::new(providers, HashMap::new());
        let err = router.chat(ProviderKind::Gemini, &req()).await.unwrap_err();
        assert!(matches!(err, crate::error::ProviderError::RateLimited));
    }
}
