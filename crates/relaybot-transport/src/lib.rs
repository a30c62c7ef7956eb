pub mod error;
pub mod fake;
pub mod reconnect;
pub mod transport;
pub mod types;

pub use error::{Result, TransportError};
pub use fake::FakeTransport;
pub use transport::Transport;
pub use types::{ConnectionStatus, OutboundPayload, Presence, QuotedContext, RemoteLabel};
