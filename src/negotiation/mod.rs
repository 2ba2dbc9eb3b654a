pub mod coordinator;
pub mod state;

pub use coordinator::{Hangup, NegotiationCoordinator};
pub use state::{CallPhase, NegotiationState, Role, Trigger};
