pub mod coordinator;
pub mod dedup;
pub mod push;

pub use coordinator::{Channel, Decision, NotificationCoordinator, SuppressReason};
pub use dedup::{Clock, CooldownKey, ManualClock, NotificationDeduper, NotificationKind, SystemClock};
pub use push::{GatewayPush, NoopPush, PushDispatch};
