//! Two-party call negotiation over a message-bus signaling channel.
//!
//! A [`SessionController`] owns one call: it subscribes to the room's
//! [`SignalingChannel`], drives a [`PeerConnection`] through offer/answer and
//! renegotiation, and exposes the call phase and media streams to the UI.

pub mod config;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, Result};
pub use logger::{init_tracing, CallEvent, EndReason};
pub use negotiation::CallPhase;
pub use peer::{
    MediaSource, MediaStream, MediaStreamState, PeerConnection, PeerId, RtcPeer,
    SampleTrackSource,
};
pub use session::{SessionController, SessionSnapshot};
pub use signaling::{LoopbackHub, MessageBus, SignalingChannel, SignalingMessage};
