use thiserror::Error;

/// Errors surfaced by the repository. `AlreadyExists` must stay distinguishable
/// from other failures (spec.md §6) so callers can re-read and reuse the
/// existing row on a unique-key race instead of treating it as fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
