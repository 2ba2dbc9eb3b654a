use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::DEFAULT_LOG_FILTER;
use crate::negotiation::CallPhase;
use crate::peer::types::PeerId;

const EVENT_BACKLOG: usize = 64;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_filter: Option<&str>) {
    let fallback = default_filter.unwrap_or(DEFAULT_LOG_FILTER);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Trickle ICE candidate as it is gathered.
pub async fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "candidate {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            init.candidate, init.sdp_mid, init.sdp_mline_index
        );
    }
}

/// Quick getStats snapshot of the nominated pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "stats {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    ConnectionFailed(String),
    /// The controller was dropped (navigated away).
    Left,
}

/// Lifecycle events for the UI layer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    PhaseChanged { from: CallPhase, to: CallPhase },
    RemoteParticipant { id: PeerId, email: Option<String> },
    LocalStream { stream_id: String },
    RemoteStream { stream_id: String },
    MediaError { message: String },
    Ended { reason: EndReason },
}

#[derive(Clone)]
pub struct Emitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BACKLOG);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn emit_phase(&self, from: CallPhase, to: CallPhase) {
        info!("phase {from} -> {to}");
        self.emit(CallEvent::PhaseChanged { from, to });
    }

    pub fn emit_remote_participant(&self, id: &PeerId, email: Option<&str>) {
        info!("remote participant {id} ({})", email.unwrap_or("unknown"));
        self.emit(CallEvent::RemoteParticipant {
            id: id.clone(),
            email: email.map(str::to_owned),
        });
    }

    pub fn emit_local_stream(&self, stream_id: &str) {
        debug!("local stream {stream_id} acquired");
        self.emit(CallEvent::LocalStream {
            stream_id: stream_id.to_owned(),
        });
    }

    pub fn emit_remote_stream(&self, stream_id: &str) {
        info!("remote stream {stream_id} available");
        self.emit(CallEvent::RemoteStream {
            stream_id: stream_id.to_owned(),
        });
    }

    pub fn emit_media_error(&self, message: &str) {
        warn!("media acquisition failed: {message}");
        self.emit(CallEvent::MediaError {
            message: message.to_owned(),
        });
    }

    pub fn emit_ended(&self, reason: EndReason) {
        info!("call ended: {reason:?}");
        self.emit(CallEvent::Ended { reason });
    }
}
