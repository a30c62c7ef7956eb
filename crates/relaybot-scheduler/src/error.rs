use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] relaybot_store::StoreError),

    #[error(transparent)]
    Kv(#[from] relaybot_kv::KvError),

    #[error(transparent)]
    Agent(#[from] relaybot_agent::AgentError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
