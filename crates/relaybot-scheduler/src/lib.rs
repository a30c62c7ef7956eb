pub mod engine;
pub mod error;

pub use engine::AutomationSweeper;
pub use error::{Result, SchedulerError};
