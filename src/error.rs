//! Error taxonomy for call negotiation.

use thiserror::Error;

use crate::negotiation::CallPhase;

pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Debug, Error)]
pub enum CallError {
    /// Permission denied or no capture device. Leaves the phase unchanged.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// A description or message that does not match any outstanding exchange.
    #[error("signaling state error: {0}")]
    SignalingState(String),

    /// Both sides had an offer in flight at the same time.
    #[error("glare with {remote}: {resolution}")]
    GlareConflict {
        remote: String,
        resolution: &'static str,
    },

    /// Terminal transport failure reported by the peer connection.
    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("{operation} is not allowed while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: CallPhase,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed `{event}` payload: {source}")]
    Decode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    /// The call ended while `operation` was still awaiting.
    #[error("call ended during {operation}")]
    Interrupted { operation: &'static str },

    /// The session task is gone (the controller outlived it).
    #[error("session is closed")]
    SessionClosed,
}

impl CallError {
    pub fn media(msg: impl std::fmt::Display) -> Self {
        Self::MediaAcquisition(msg.to_string())
    }

    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::SignalingState(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// A hang-up cut the operation short; the call is ending.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
