use chrono::{DateTime, Utc};

use crate::logger::EndReason;
use crate::negotiation::CallPhase;
use crate::peer::media::{MediaStream, MediaStreamState};
use crate::peer::types::PeerId;

/// Everything one call owns. Lives inside the session task.
#[derive(Debug)]
pub struct PeerSession {
    pub local_id: PeerId,
    pub remote: Option<PeerId>,
    pub remote_email: Option<String>,
    pub phase: CallPhase,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub media: MediaStreamState,
    /// Set after the one local-track attach of this call.
    pub tracks_attached: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl PeerSession {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            remote: None,
            remote_email: None,
            phase: CallPhase::Idle,
            local_stream: None,
            remote_stream: None,
            media: MediaStreamState::default(),
            tracks_attached: false,
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }
}

/// Read-only view published after every handled input.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub local_id: PeerId,
    pub phase: CallPhase,
    pub remote: Option<PeerId>,
    pub remote_email: Option<String>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub media: MediaStreamState,
    /// Local offers generated, initial and renegotiation.
    pub offers_sent: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl SessionSnapshot {
    pub fn initial(local_id: PeerId) -> Self {
        Self {
            local_id,
            phase: CallPhase::Idle,
            remote: None,
            remote_email: None,
            local_stream: None,
            remote_stream: None,
            media: MediaStreamState::default(),
            offers_sent: 0,
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn remote_participant_known(&self) -> bool {
        self.remote.is_some()
    }

    /// Time spent connected so far, or in total once ended.
    pub fn call_duration(&self) -> Option<chrono::Duration> {
        let start = self.connected_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_frozen_once_ended() {
        let mut snapshot = SessionSnapshot::initial(PeerId::from("alice"));
        assert!(snapshot.call_duration().is_none());

        let start = Utc::now();
        snapshot.connected_at = Some(start);
        snapshot.ended_at = Some(start + chrono::Duration::seconds(42));
        assert_eq!(snapshot.call_duration(), Some(chrono::Duration::seconds(42)));
    }
}
