use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowsError {
    #[error("store error: {0}")]
    Store(#[from] relaybot_store::StoreError),
}

pub type Result<T> = std::result::Result<T, FlowsError>;
