use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::adapter::{Notifier, PeerConnection, PeerNotification};
use crate::peer::media::{MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::peer::types::SessionDescription;

type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// `webrtc`-backed peer connection, one per session.
///
/// The native connection is swapped out when an offer has to be dropped
/// before anything was ever agreed: `webrtc` has no rollback, and a fresh
/// connection with the same tracks is indistinguishable to the remote side.
pub struct RtcPeer {
    api: API,
    rtc_config: RTCConfiguration,
    pc: Mutex<Arc<RTCPeerConnection>>,
    notifier: Mutex<Option<Notifier>>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    gather_timeout: Duration,
    grace_period: Duration,
    disconnect_task: TaskSlot,
    failure_reported: Arc<AtomicBool>,
}

impl RtcPeer {
    pub async fn new(config: &CallConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let rtc_config = config.rtc_configuration();
        let pc = open(&api, &rtc_config).await?;

        Ok(Self {
            api,
            rtc_config,
            pc: Mutex::new(pc),
            notifier: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            gather_timeout: config.ice_gather_timeout(),
            grace_period: config.disconnect_grace(),
            disconnect_task: Arc::new(Mutex::new(None)),
            failure_reported: Arc::new(AtomicBool::new(false)),
        })
    }

    fn pc(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs `desc` locally and returns the description once ICE gathering
    /// finished or timed out; the signaling vocabulary carries no trickle
    /// candidates, so they have to ride inside the SDP.
    async fn set_local_and_gather(
        &self,
        pc: &RTCPeerConnection,
        desc: RTCSessionDescription,
    ) -> Result<SessionDescription> {
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;
        if timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering still running after {} s, sending partial candidates",
                self.gather_timeout.as_secs()
            );
        }
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| CallError::signaling("local description missing after set"))?;
        SessionDescription::from_rtc(&local)
    }

    /// Registers the owner's callbacks on `pc`.
    fn wire(&self, pc: &Arc<RTCPeerConnection>, notify: Notifier) {
        let on_nego = notify.clone();
        let nego_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
        pc.on_negotiation_needed(Box::new(move || {
            let notify = on_nego.clone();
            let pc = nego_pc.clone();
            Box::pin(async move {
                let Some(pc) = pc.upgrade() else {
                    return;
                };
                if pc.current_local_description().await.is_none() {
                    debug!("negotiation needed before the first exchange, covered by it");
                    return;
                }
                debug!("negotiation needed");
                notify(PeerNotification::NegotiationNeeded);
            })
        }));

        let on_track = notify.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some((stream_id, media)) = remote_track(&track) {
                    info!("remote {:?} track {} arrived", media.kind(), media.id());
                    on_track(PeerNotification::RemoteTrack {
                        stream_id,
                        track: media,
                    });
                }
                Box::pin(async {})
            },
        ));

        let pc_weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
        let slot = self.disconnect_task.clone();
        let failed = self.failure_reported.clone();
        let grace = self.grace_period;
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("peer connection state changed to {:?}", st);
            match st {
                RTCPeerConnectionState::Connected => {
                    if let Some(handle) = slot.lock().unwrap_or_else(PoisonError::into_inner).take()
                    {
                        info!("connection recovered, cancelling pending failure");
                        handle.abort();
                    }
                }
                RTCPeerConnectionState::Failed => {
                    if let Some(pc) = pc_weak.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                    report_failure(&failed, &notify, "ICE connection failed".into());
                }
                RTCPeerConnectionState::Disconnected => {
                    let mut pending = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    if pending.is_some() {
                        debug!("grace period already running");
                    } else {
                        let pc_weak = pc_weak.clone();
                        let failed = failed.clone();
                        let notify = notify.clone();
                        *pending = Some(tokio::spawn(async move {
                            warn!("transport disconnected, waiting {} s", grace.as_secs());
                            sleep(grace).await;
                            let Some(pc) = pc_weak.upgrade() else {
                                return;
                            };
                            let state_now = pc.connection_state();
                            if state_now != RTCPeerConnectionState::Connected {
                                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                                report_failure(
                                    &failed,
                                    &notify,
                                    format!("connection not recovered ({state_now:?})"),
                                );
                            }
                        }));
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));
    }

    /// Replaces a connection that never completed an exchange with a fresh
    /// one carrying the same local tracks.
    async fn rebuild(&self) -> Result<()> {
        let fresh = open(&self.api, &self.rtc_config).await?;
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notify) = notifier {
            self.wire(&fresh, notify);
        }
        let tracks = self
            .local_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for track in tracks {
            add_sender(&fresh, track).await?;
        }
        let stale = std::mem::replace(
            &mut *self.pc.lock().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        if let Err(e) = stale.close().await {
            warn!("closing replaced peer connection: {e}");
        }
        info!("unanswered connection replaced");
        Ok(())
    }
}

async fn open(api: &API, config: &RTCConfiguration) -> Result<Arc<RTCPeerConnection>> {
    let pc = Arc::new(api.new_peer_connection(config.clone()).await?);
    pc.on_ice_candidate(Box::new(|cand: Option<RTCIceCandidate>| {
        Box::pin(async move {
            match cand {
                Some(c) => dump_candidate("LOCAL", &c).await,
                None => debug!("ICE candidate gathering completed"),
            }
        })
    }));
    Ok(pc)
}

async fn add_sender(pc: &RTCPeerConnection, track: Arc<TrackLocalStaticSample>) -> Result<()> {
    let sender = pc
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    // RTCP has to be drained for the interceptors to work
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
    Ok(())
}

fn report_failure(flag: &AtomicBool, notify: &Notifier, reason: String) {
    if !flag.swap(true, Ordering::SeqCst) {
        notify(PeerNotification::ConnectionFailed(reason));
    }
}

fn remote_track(track: &Arc<TrackRemote>) -> Option<(String, Arc<MediaTrack>)> {
    let kind = match track.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        _ => return None,
    };
    let media = MediaTrack::new(
        track.id().to_string(),
        kind,
        TrackSource::Remote(Arc::clone(track)),
    );
    Some((track.stream_id().to_string(), Arc::new(media)))
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn bind(&self, notify: Notifier) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(notify.clone());
        self.wire(&self.pc(), notify);
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let pc = self.pc();
        let offer = pc.create_offer(None).await?;
        self.set_local_and_gather(&pc, offer).await
    }

    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        let pc = self.pc();
        pc.set_remote_description(offer.to_rtc()?).await?;
        let answer = pc.create_answer(None).await?;
        self.set_local_and_gather(&pc, answer).await
    }

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<()> {
        let pc = self.pc();
        let state = pc.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(CallError::signaling(format!(
                "answer received in signaling state {state}"
            )));
        }
        pc.set_remote_description(answer.to_rtc()?).await?;
        Ok(())
    }

    /// `webrtc` refuses a `rollback` description. Before the first exchange
    /// the connection is rebuilt; afterwards the last agreed remote
    /// description is committed again as the answer to the dropped offer.
    async fn rollback(&self) -> Result<()> {
        let pc = self.pc();
        if pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        match pc.current_remote_description().await {
            None => self.rebuild().await,
            Some(agreed) => {
                debug!("re-committing the agreed remote description");
                pc.set_remote_description(RTCSessionDescription::answer(agreed.sdp)?)
                    .await?;
                Ok(())
            }
        }
    }

    async fn attach_tracks(&self, stream: &MediaStream) -> Result<usize> {
        let pc = self.pc();
        let mut attached = 0;
        for track in stream.tracks() {
            let TrackSource::Local(local) = track.source() else {
                continue;
            };
            add_sender(&pc, Arc::clone(local)).await?;
            self.local_tracks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(local));
            attached += 1;
        }
        Ok(attached)
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self
            .disconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        // closing is not a failure
        self.failure_reported.store(true, Ordering::SeqCst);
        self.pc().close().await?;
        Ok(())
    }
}
