use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{CallError, Result};

/// Identity of a participant on the signaling bus (its socket/connection id).
///
/// Ordering is lexicographic and decides who yields on glare.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Serialized session description as it travels on the wire:
/// `{"type": "offer", "sdp": "v=0..."}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer | RTCSdpType::Pranswer => SdpKind::Answer,
            other => {
                return Err(CallError::SignalingState(format!(
                    "unexpected local description type {other}"
                )))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }

    /// Parses the SDP text into a `webrtc` description of the matching type.
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone())?,
        };
        Ok(desc)
    }
}

/// ICE server entry as configured by the operator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
