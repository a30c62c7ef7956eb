use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session not connected: {0}")]
    NotConnected(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
