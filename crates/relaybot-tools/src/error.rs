use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolsError {
    #[error("store error: {0}")]
    Store(#[from] relaybot_store::StoreError),

    #[error("tool name '{0}' collides with a built-in")]
    ReservedName(String),
}

pub type Result<T> = std::result::Result<T, ToolsError>;
