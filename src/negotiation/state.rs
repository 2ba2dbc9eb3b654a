use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CallError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No remote participant known.
    Idle,
    /// Remote participant known, local user has not decided yet.
    AwaitingUserConfirmation,
    /// Local call offer sent, waiting for `call:accepted`.
    OfferSent,
    /// Remote call offer answered, local tracks not attached yet.
    AnswerSent,
    Connected,
    /// Terminal.
    Ended,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        self == CallPhase::Ended
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::Idle => "idle",
            CallPhase::AwaitingUserConfirmation => "awaiting-user-confirmation",
            CallPhase::OfferSent => "offer-sent",
            CallPhase::AnswerSent => "answer-sent",
            CallPhase::Connected => "connected",
            CallPhase::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Local side's part in the in-flight exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// What to do with a negotiation-needed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// No offer outstanding: offer now.
    OfferNow,
    /// Folded into the follow-up offer due when the current round completes.
    Deferred,
}

/// Per-session offer bookkeeping.
///
/// At most one local offer is outstanding; any number of triggers during
/// that window collapse into a single follow-up.
#[derive(Debug, Default)]
pub struct NegotiationState {
    role: Option<Role>,
    offer_outstanding: bool,
    follow_up: bool,
    sequence: u64,
}

impl NegotiationState {
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn offer_outstanding(&self) -> bool {
        self.offer_outstanding
    }

    pub fn follow_up_pending(&self) -> bool {
        self.follow_up
    }

    /// Offers generated so far in this session.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Marks a local offer as outstanding and returns its sequence number.
    pub fn begin_offer(&mut self) -> Result<u64> {
        if self.offer_outstanding {
            return Err(CallError::signaling(format!(
                "offer #{} is still unanswered",
                self.sequence
            )));
        }
        self.offer_outstanding = true;
        self.role = Some(Role::Offerer);
        self.sequence += 1;
        Ok(self.sequence)
    }

    /// The outstanding offer was answered. Returns whether a follow-up offer
    /// is now due.
    pub fn complete_offer(&mut self) -> Result<bool> {
        if !self.offer_outstanding {
            return Err(CallError::signaling("answer without an outstanding offer"));
        }
        self.offer_outstanding = false;
        self.role = None;
        Ok(std::mem::take(&mut self.follow_up))
    }

    /// The answer to the outstanding offer could not be applied. The round
    /// is over; returns whether a follow-up was already due.
    pub fn fail_offer(&mut self) -> bool {
        self.abandon_offer();
        std::mem::take(&mut self.follow_up)
    }

    /// The offer never left or was rolled back; the sequence number stays
    /// consumed.
    pub fn abandon_offer(&mut self) {
        self.offer_outstanding = false;
        self.role = None;
    }

    pub fn begin_answer(&mut self) {
        self.role = Some(Role::Answerer);
    }

    pub fn abandon_answer(&mut self) {
        if self.role == Some(Role::Answerer) {
            self.role = None;
        }
    }

    /// Finishes an answer. Returns whether a deferred offer is now due.
    pub fn complete_answer(&mut self) -> bool {
        if self.role == Some(Role::Answerer) {
            self.role = None;
        }
        !self.offer_outstanding && std::mem::take(&mut self.follow_up)
    }

    /// Requests one offer as soon as no other is outstanding.
    pub fn defer_offer(&mut self) {
        self.follow_up = true;
    }

    pub fn on_negotiation_needed(&mut self) -> Trigger {
        if !self.offer_outstanding {
            return Trigger::OfferNow;
        }
        self.follow_up = true;
        Trigger::Deferred
    }

    pub fn reset(&mut self) {
        self.role = None;
        self.offer_outstanding = false;
        self.follow_up = false;
    }
}
