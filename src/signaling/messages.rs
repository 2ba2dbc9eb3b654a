//! Wire vocabulary of the signaling bus.
//!
//! The same logical message travels under different event names depending on
//! direction: a call offer leaves as `user:call {to, offer}` and reaches the
//! callee as `incomming:call {from, offer}`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{CallError, Result};
use crate::peer::types::{PeerId, SessionDescription};

pub const USER_JOINED: &str = "user:joined";
pub const USER_CALL: &str = "user:call";
// spelled as the bus spells it
pub const INCOMING_CALL: &str = "incomming:call";
pub const CALL_ACCEPTED: &str = "call:accepted";
pub const NEGO_NEEDED: &str = "peer:nego:needed";
pub const NEGO_DONE: &str = "peer:nego:done";
pub const NEGO_FINAL: &str = "peer:nego:final";
pub const CALL_ENDED: &str = "call:ended";

/// Events a session subscribes to.
pub const INBOUND_EVENTS: [&str; 6] = [
    USER_JOINED,
    INCOMING_CALL,
    CALL_ACCEPTED,
    NEGO_NEEDED,
    NEGO_FINAL,
    CALL_ENDED,
];

/// `peer` is the counterpart: the recipient on the way out, the sender on the
/// way in. It is optional where the bus may omit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    JoinNotice {
        peer: PeerId,
        email: Option<String>,
    },
    CallOffer {
        peer: PeerId,
        offer: SessionDescription,
    },
    CallAnswer {
        peer: Option<PeerId>,
        answer: SessionDescription,
    },
    NegotiationOffer {
        peer: PeerId,
        offer: SessionDescription,
    },
    NegotiationAnswer {
        peer: Option<PeerId>,
        answer: SessionDescription,
    },
    CallEnded {
        peer: Option<PeerId>,
    },
}

#[derive(Deserialize)]
struct JoinPayload {
    #[serde(default)]
    email: Option<String>,
    id: PeerId,
}

#[derive(Deserialize)]
struct OfferPayload {
    from: PeerId,
    offer: SessionDescription,
}

#[derive(Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    from: Option<PeerId>,
    ans: SessionDescription,
}

#[derive(Deserialize)]
struct EndedPayload {
    #[serde(default)]
    from: Option<PeerId>,
}

fn parse<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|source| CallError::Decode {
        event: event.to_owned(),
        source,
    })
}

fn with_recipient(peer: Option<&PeerId>, mut body: Map<String, Value>) -> Value {
    if let Some(peer) = peer {
        body.insert("to".into(), json!(peer));
    }
    Value::Object(body)
}

impl SignalingMessage {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::JoinNotice { .. } => "join-notice",
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::NegotiationOffer { .. } => "negotiation-offer",
            Self::NegotiationAnswer { .. } => "negotiation-answer",
            Self::CallEnded { .. } => "call-ended",
        }
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Self::JoinNotice { peer, .. }
            | Self::CallOffer { peer, .. }
            | Self::NegotiationOffer { peer, .. } => Some(peer),
            Self::CallAnswer { peer, .. }
            | Self::NegotiationAnswer { peer, .. }
            | Self::CallEnded { peer } => peer.as_ref(),
        }
    }

    /// Event name and payload for sending this message to `peer`.
    pub fn encode(&self) -> (&'static str, Value) {
        let mut body = Map::new();
        match self {
            Self::JoinNotice { peer, email } => {
                body.insert("id".into(), json!(peer));
                body.insert("email".into(), json!(email));
                (USER_JOINED, Value::Object(body))
            }
            Self::CallOffer { peer, offer } => {
                body.insert("offer".into(), json!(offer));
                (USER_CALL, with_recipient(Some(peer), body))
            }
            Self::CallAnswer { peer, answer } => {
                body.insert("ans".into(), json!(answer));
                (CALL_ACCEPTED, with_recipient(peer.as_ref(), body))
            }
            Self::NegotiationOffer { peer, offer } => {
                body.insert("offer".into(), json!(offer));
                (NEGO_NEEDED, with_recipient(Some(peer), body))
            }
            Self::NegotiationAnswer { peer, answer } => {
                body.insert("ans".into(), json!(answer));
                (NEGO_DONE, with_recipient(peer.as_ref(), body))
            }
            Self::CallEnded { peer } => (CALL_ENDED, with_recipient(peer.as_ref(), body)),
        }
    }

    /// Decodes an inbound event.
    pub fn decode(event: &str, payload: Value) -> Result<Self> {
        let message = match event {
            USER_JOINED => {
                let p: JoinPayload = parse(event, payload)?;
                Self::JoinNotice {
                    peer: p.id,
                    email: p.email,
                }
            }
            INCOMING_CALL => {
                let p: OfferPayload = parse(event, payload)?;
                Self::CallOffer {
                    peer: p.from,
                    offer: p.offer,
                }
            }
            CALL_ACCEPTED => {
                let p: AnswerPayload = parse(event, payload)?;
                Self::CallAnswer {
                    peer: p.from,
                    answer: p.ans,
                }
            }
            NEGO_NEEDED => {
                let p: OfferPayload = parse(event, payload)?;
                Self::NegotiationOffer {
                    peer: p.from,
                    offer: p.offer,
                }
            }
            NEGO_FINAL => {
                let p: AnswerPayload = parse(event, payload)?;
                Self::NegotiationAnswer {
                    peer: p.from,
                    answer: p.ans,
                }
            }
            CALL_ENDED => {
                let p: EndedPayload = parse(event, payload)?;
                Self::CallEnded { peer: p.from }
            }
            other => {
                return Err(CallError::signaling(format!(
                    "unknown inbound event `{other}`"
                )))
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_offer_leaves_as_user_call() {
        let (event, payload) = SignalingMessage::CallOffer {
            peer: "bob".into(),
            offer: SessionDescription::offer("v=0"),
        }
        .encode();
        assert_eq!(event, USER_CALL);
        assert_eq!(
            payload,
            json!({"to": "bob", "offer": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn renegotiation_answer_leaves_as_nego_done() {
        let (event, payload) = SignalingMessage::NegotiationAnswer {
            peer: Some("alice".into()),
            answer: SessionDescription::answer("v=0"),
        }
        .encode();
        assert_eq!(event, NEGO_DONE);
        assert_eq!(payload["to"], "alice");
        assert_eq!(payload["ans"]["type"], "answer");
    }

    #[test]
    fn decodes_incoming_call() {
        let msg = SignalingMessage::decode(
            INCOMING_CALL,
            json!({"from": "alice", "offer": {"type": "offer", "sdp": "v=0"}}),
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::CallOffer {
                peer: "alice".into(),
                offer: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn nego_final_may_omit_sender() {
        let msg = SignalingMessage::decode(
            NEGO_FINAL,
            json!({"ans": {"type": "answer", "sdp": "v=0"}}),
        )
        .unwrap();
        assert_eq!(msg.peer(), None);
        assert_eq!(msg.label(), "negotiation-answer");
    }

    #[test]
    fn call_ended_accepts_either_shape() {
        let bare = SignalingMessage::decode(CALL_ENDED, json!({"to": "bob"})).unwrap();
        assert_eq!(bare, SignalingMessage::CallEnded { peer: None });
        let routed = SignalingMessage::decode(CALL_ENDED, json!({"from": "bob"})).unwrap();
        assert_eq!(routed.peer(), Some(&PeerId::from("bob")));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = SignalingMessage::decode(INCOMING_CALL, json!({"from": "alice"})).unwrap_err();
        assert!(matches!(err, CallError::Decode { ref event, .. } if event == INCOMING_CALL));
    }

    #[test]
    fn outbound_only_events_are_not_decoded() {
        assert!(SignalingMessage::decode(USER_CALL, json!({})).is_err());
    }
}
