pub mod bus;
pub mod publisher;

pub use bus::{EventBus, MatchingEvent};
