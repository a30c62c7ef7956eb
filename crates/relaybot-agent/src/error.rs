use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] relaybot_store::StoreError),

    #[error(transparent)]
    Conversation(#[from] relaybot_conversation::ConversationError),

    #[error(transparent)]
    Provider(#[from] relaybot_providers::ProviderError),

    #[error(transparent)]
    Kv(#[from] relaybot_kv::KvError),

    #[error(transparent)]
    Flows(#[from] relaybot_flows::FlowsError),

    #[error(transparent)]
    Tools(#[from] relaybot_tools::ToolsError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
