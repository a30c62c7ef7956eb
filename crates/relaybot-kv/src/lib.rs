pub mod error;
pub mod store;
pub mod stream;

pub use error::{KvError, Result};
pub use store::{InMemoryKv, KvStore};
pub use stream::{InMemoryStream, OutboundStream};
