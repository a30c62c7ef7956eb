pub mod accumulator;
pub mod engine;
pub mod error;
pub mod media;

pub use accumulator::{Accumulator, MessageSink};
pub use engine::AIEngine;
pub use error::{AgentError, Result};
pub use media::{MediaPipeline, NoopMediaPipeline};
