pub mod error;
pub mod failover;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod types;

pub use error::{ProviderError, Result};
pub use failover::ProviderRouter;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::LlmProvider;
pub use types::{ChatRequest, ChatResponse, ThinkingLevel, ToolSpec, Usage};
