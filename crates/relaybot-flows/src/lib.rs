pub mod engine;
pub mod error;
pub mod matcher;

pub use engine::FlowEngine;
pub use error::{FlowsError, Result};
pub use matcher::TriggerMatcher;
