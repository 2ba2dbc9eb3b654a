use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::peer::media::{MediaStream, MediaTrack};
use crate::peer::types::SessionDescription;

/// Asynchronous notifications a peer connection raises to its owner.
#[derive(Debug, Clone)]
pub enum PeerNotification {
    /// The last agreed description no longer covers the local track set.
    /// Never raised before the first exchange completes: whatever is attached
    /// by then rides in the first offer or answer.
    NegotiationNeeded,
    /// Remote media started flowing on `track`, grouped by `stream_id`.
    RemoteTrack {
        stream_id: String,
        track: Arc<MediaTrack>,
    },
    /// Terminal: ICE/DTLS could not be established or was lost for good.
    ConnectionFailed(String),
}

/// Sink registered once per session; invoked from the connection's callbacks.
pub type Notifier = Arc<dyn Fn(PeerNotification) + Send + Sync>;

/// One native peer connection, owned by exactly one session.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Registers the notification sink. Called once, before any other method.
    fn bind(&self, notify: Notifier);

    /// Generates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Installs `offer` as remote description, then generates and installs
    /// the local answer.
    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Installs `answer` as remote description. Fails with
    /// `CallError::SignalingState` when no local offer is outstanding.
    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Drops the outstanding local offer, returning to a stable state with
    /// the attached tracks kept. No-op when no local offer is outstanding.
    async fn rollback(&self) -> Result<()>;

    /// Adds every track of `stream`; returns how many were added. Additions
    /// after the first completed exchange raise `NegotiationNeeded`.
    async fn attach_tracks(&self, stream: &MediaStream) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}
