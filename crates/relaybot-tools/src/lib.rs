pub mod builtin;
pub mod error;
pub mod executor;
pub mod registry;
pub mod types;

pub use error::{Result, ToolsError};
pub use executor::{ToolContext, ToolExecutor};
pub use registry::ToolRegistry;
pub use types::{ToolCallResult, ToolDefinition, REPLY_ALREADY_HANDLED_MESSAGE};
