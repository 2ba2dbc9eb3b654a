pub mod channel;
pub mod loopback;
pub mod messages;

pub use channel::{Handler, MessageBus, SignalingChannel, SubscriptionId};
pub use loopback::LoopbackHub;
pub use messages::SignalingMessage;
