pub mod bus;
pub mod types;

pub use bus::{BotSubscription, EventBus};
pub use types::{Event, Subject};
