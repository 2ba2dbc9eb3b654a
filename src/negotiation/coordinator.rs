//! Call-level state machine.
//!
//! One coordinator per session. It is driven by a single task, one input at a
//! time, so every method here runs to completion before the next input is
//! looked at. Inputs that do not fit the current phase are logged and dropped.
//! The one exception is a [`Hangup`]: it arrives on its own lane and cuts
//! short whatever media or peer-connection step is being awaited.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};
use crate::logger::{EndReason, Emitter};
use crate::negotiation::state::{CallPhase, NegotiationState, Trigger};
use crate::peer::adapter::{PeerConnection, PeerNotification};
use crate::peer::media::{MediaConstraints, MediaSource, MediaStream, MediaTrack, TrackKind};
use crate::peer::types::{PeerId, SessionDescription};
use crate::session::state::{PeerSession, SessionSnapshot};
use crate::signaling::{SignalingChannel, SignalingMessage};

/// Inputs that end the call.
#[derive(Debug)]
pub enum Hangup {
    /// `end_call` or the owner leaving; `done` fires once the call has ended.
    Local {
        reason: EndReason,
        done: Option<oneshot::Sender<()>>,
    },
    /// `call:ended` received, with its sender if the relay named one.
    Remote(Option<PeerId>),
    /// Terminal transport failure.
    Failed(String),
}

impl Hangup {
    /// Whether this ends a call with `remote`.
    fn concerns(&self, remote: Option<&PeerId>) -> bool {
        match (self, remote) {
            (Hangup::Remote(Some(from)), Some(remote)) => from == remote,
            _ => true,
        }
    }
}

struct Hangups {
    rx: mpsc::UnboundedReceiver<Hangup>,
    /// Received while a step was in flight, handled once the step unwound.
    cut_in: Option<Hangup>,
}

impl Hangups {
    /// Awaits `work` unless a hang-up for this call arrives first.
    async fn race<T>(
        &mut self,
        remote: Option<&PeerId>,
        operation: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if self.cut_in.is_some() {
            return Err(CallError::Interrupted { operation });
        }
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                Some(hangup) = self.rx.recv() => {
                    if hangup.concerns(remote) {
                        debug!("{operation} cut short by {hangup:?}");
                        self.cut_in = Some(hangup);
                        return Err(CallError::Interrupted { operation });
                    }
                    debug!("{hangup:?} is not for this call");
                }
                out = &mut work => return out,
            }
        }
    }
}

pub struct NegotiationCoordinator<P, M> {
    session: PeerSession,
    state: NegotiationState,
    peer: P,
    media: M,
    channel: Arc<SignalingChannel>,
    events: Emitter,
    constraints: MediaConstraints,
    hangups: Hangups,
}

impl<P: PeerConnection, M: MediaSource> NegotiationCoordinator<P, M> {
    pub fn new(
        local_id: PeerId,
        peer: P,
        media: M,
        channel: Arc<SignalingChannel>,
        events: Emitter,
        constraints: MediaConstraints,
        hangups: mpsc::UnboundedReceiver<Hangup>,
    ) -> Self {
        Self {
            session: PeerSession::new(local_id),
            state: NegotiationState::default(),
            peer,
            media,
            channel,
            events,
            constraints,
            hangups: Hangups {
                rx: hangups,
                cut_in: None,
            },
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.session.phase
    }

    pub fn negotiation(&self) -> &NegotiationState {
        &self.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.session.local_id.clone(),
            phase: self.session.phase,
            remote: self.session.remote.clone(),
            remote_email: self.session.remote_email.clone(),
            local_stream: self.session.local_stream.clone(),
            remote_stream: self.session.remote_stream.clone(),
            media: self.session.media,
            offers_sent: self.state.sequence(),
            connected_at: self.session.connected_at,
            ended_at: self.session.ended_at,
            end_reason: self.session.end_reason.clone(),
        }
    }

    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        let label = message.label();
        if self.session.phase.is_terminal() {
            debug!(
                "{}",
                CallError::signaling(format!("{label} after the call ended"))
            );
            return;
        }
        if let Err(e) = self.on_signal(message).await {
            warn!("{label} dropped: {e}");
        }
    }

    pub async fn handle_notification(&mut self, notification: PeerNotification) {
        if self.session.phase.is_terminal() {
            debug!("peer notification after the call ended: {notification:?}");
            return;
        }
        match notification {
            PeerNotification::NegotiationNeeded => self.on_negotiation_needed().await,
            PeerNotification::RemoteTrack { stream_id, track } => {
                self.add_remote_track(stream_id, track)
            }
            PeerNotification::ConnectionFailed(reason) => {
                self.hang_up(Hangup::Failed(reason)).await;
            }
        }
    }

    /// Next hang-up, starting with one that cut a step short.
    pub async fn next_hangup(&mut self) -> Option<Hangup> {
        if let Some(hangup) = self.hangups.cut_in.take() {
            return Some(hangup);
        }
        self.hangups.rx.recv().await
    }

    /// The hang-up that interrupted the last input, if any.
    pub fn take_cut_in(&mut self) -> Option<Hangup> {
        self.hangups.cut_in.take()
    }

    /// Ends the call; no-op once ended. Returns the completion signal of a
    /// local hang-up for the caller to fire.
    pub async fn hang_up(&mut self, hangup: Hangup) -> Option<oneshot::Sender<()>> {
        match hangup {
            Hangup::Local { reason, done } => {
                self.enter_ended(reason, true).await;
                done
            }
            Hangup::Remote(peer) => {
                self.on_remote_end(peer).await;
                None
            }
            Hangup::Failed(reason) => {
                warn!("{}", CallError::ConnectionFailure(reason.clone()));
                self.enter_ended(EndReason::ConnectionFailed(reason), true)
                    .await;
                None
            }
        }
    }

    /// Acquires local media, attaches it and sends the initial offer, which
    /// already describes every local track.
    pub async fn initiate_call(&mut self) -> Result<()> {
        let phase = self.session.phase;
        if phase != CallPhase::AwaitingUserConfirmation {
            return Err(CallError::InvalidPhase {
                operation: "initiate_call",
                phase,
            });
        }
        let remote = self.remote()?.clone();
        self.ensure_local_media().await?;
        self.attach_local_tracks().await?;

        let seq = self.state.begin_offer()?;
        let offer = match self
            .hangups
            .race(Some(&remote), "offer", self.peer.create_offer())
            .await
        {
            Ok(offer) => offer,
            Err(e) => {
                self.state.abandon_offer();
                return Err(e);
            }
        };
        info!("calling {remote} with offer #{seq}");
        self.channel.send(&SignalingMessage::CallOffer {
            peer: remote,
            offer,
        });
        self.transition(CallPhase::OfferSent);
        Ok(())
    }

    /// Returns the new audio flag.
    pub fn toggle_mute(&mut self) -> Result<bool> {
        self.toggle(TrackKind::Audio, "toggle_mute")
    }

    /// Returns the new video flag.
    pub fn toggle_video(&mut self) -> Result<bool> {
        self.toggle(TrackKind::Video, "toggle_video")
    }

    async fn on_signal(&mut self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::JoinNotice { peer, email } => self.on_join(peer, email),
            SignalingMessage::CallOffer { peer, offer } => self.on_call_offer(peer, offer).await,
            SignalingMessage::CallAnswer { peer, answer } => {
                self.on_call_answer(peer, answer).await
            }
            SignalingMessage::NegotiationOffer { peer, offer } => {
                self.on_negotiation_offer(peer, offer).await
            }
            SignalingMessage::NegotiationAnswer { peer, answer } => {
                self.on_negotiation_answer(peer, answer).await
            }
            SignalingMessage::CallEnded { peer } => {
                self.on_remote_end(peer).await;
                Ok(())
            }
        }
    }

    fn on_join(&mut self, peer: PeerId, email: Option<String>) -> Result<()> {
        match self.session.phase {
            CallPhase::Idle => {
                self.record_remote(peer, email);
                self.transition(CallPhase::AwaitingUserConfirmation);
                Ok(())
            }
            phase => Err(CallError::signaling(format!(
                "join notice from {peer} while {phase}"
            ))),
        }
    }

    async fn on_call_offer(&mut self, peer: PeerId, offer: SessionDescription) -> Result<()> {
        match self.session.phase {
            CallPhase::Idle => {
                self.record_remote(peer.clone(), None);
                self.transition(CallPhase::AwaitingUserConfirmation);
            }
            CallPhase::AwaitingUserConfirmation => self.check_sender(Some(&peer))?,
            CallPhase::OfferSent => {
                self.check_sender(Some(&peer))?;
                if !self.yields_to(&peer) {
                    self.keep_offer(&peer);
                    return Ok(());
                }
                self.yield_offer(&peer).await?;
            }
            phase => {
                return Err(CallError::signaling(format!(
                    "call offer from {peer} while {phase}"
                )))
            }
        }
        self.answer_call(peer, offer).await
    }

    /// Local tracks are attached before answering so the answer carries them.
    async fn answer_call(&mut self, peer: PeerId, offer: SessionDescription) -> Result<()> {
        self.ensure_local_media().await?;
        if let Err(e) = self.attach_local_tracks().await {
            if !e.is_interrupted() {
                self.enter_ended(EndReason::ConnectionFailed(e.to_string()), true)
                    .await;
            }
            return Err(e);
        }
        let answer = self.answer(&offer).await?;
        info!("answering call from {peer}");
        self.channel.send(&SignalingMessage::CallAnswer {
            peer: Some(peer),
            answer,
        });
        self.transition(CallPhase::AnswerSent);
        let due = self.state.complete_answer();
        self.transition(CallPhase::Connected);
        if due {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn on_call_answer(
        &mut self,
        peer: Option<PeerId>,
        answer: SessionDescription,
    ) -> Result<()> {
        let phase = self.session.phase;
        if phase != CallPhase::OfferSent {
            return Err(CallError::signaling(format!("call answer while {phase}")));
        }
        self.check_sender(peer.as_ref())?;
        let applied = self
            .hangups
            .race(
                self.session.remote.as_ref(),
                "apply answer",
                self.peer.apply_remote_answer(&answer),
            )
            .await;
        if let Err(e) = applied {
            self.state.abandon_offer();
            if !e.is_interrupted() {
                let reason = format!("call answer rejected: {e}");
                self.enter_ended(EndReason::ConnectionFailed(reason), true)
                    .await;
            }
            return Err(e);
        }
        let due = self.state.complete_offer()?;
        self.transition(CallPhase::Connected);
        if due {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn on_negotiation_offer(&mut self, peer: PeerId, offer: SessionDescription) -> Result<()> {
        let phase = self.session.phase;
        if phase != CallPhase::Connected {
            return Err(CallError::signaling(format!(
                "negotiation offer from {peer} while {phase}"
            )));
        }
        self.check_sender(Some(&peer))?;
        if self.state.offer_outstanding() {
            if !self.yields_to(&peer) {
                self.keep_offer(&peer);
                return Ok(());
            }
            self.yield_offer(&peer).await?;
            self.state.defer_offer();
        }

        let answer = self.answer(&offer).await?;
        debug!("renegotiation answer to {peer}");
        self.channel.send(&SignalingMessage::NegotiationAnswer {
            peer: Some(peer),
            answer,
        });
        if self.state.complete_answer() {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn on_negotiation_answer(
        &mut self,
        peer: Option<PeerId>,
        answer: SessionDescription,
    ) -> Result<()> {
        if self.session.phase != CallPhase::Connected || !self.state.offer_outstanding() {
            return Err(CallError::signaling(
                "negotiation answer without an outstanding offer",
            ));
        }
        self.check_sender(peer.as_ref())?;
        let applied = self
            .hangups
            .race(
                self.session.remote.as_ref(),
                "apply answer",
                self.peer.apply_remote_answer(&answer),
            )
            .await;
        if let Err(e) = applied {
            if !e.is_interrupted() {
                self.recover_failed_round().await;
            }
            return Err(e);
        }
        debug!("renegotiation round #{} complete", self.state.sequence());
        if self.state.complete_offer()? {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn on_remote_end(&mut self, peer: Option<PeerId>) {
        let hangup = Hangup::Remote(peer);
        if !hangup.concerns(self.session.remote.as_ref()) {
            debug!("{hangup:?} is not from our counterpart");
            return;
        }
        self.enter_ended(EndReason::RemoteHangup, false).await;
    }

    async fn on_negotiation_needed(&mut self) {
        let phase = self.session.phase;
        if phase != CallPhase::Connected {
            debug!("negotiation needed while {phase}, ignored");
            return;
        }
        match self.state.on_negotiation_needed() {
            Trigger::OfferNow => {
                if let Err(e) = self.renegotiate().await {
                    warn!("renegotiation failed: {e}");
                }
            }
            Trigger::Deferred => debug!(
                "offer #{} outstanding, renegotiation deferred",
                self.state.sequence()
            ),
        }
    }

    /// The counterpart's renegotiation answer was unusable. Drops our offer
    /// so the next trigger can offer again, and sends any follow-up that
    /// was already waiting.
    async fn recover_failed_round(&mut self) {
        if let Err(e) = self.peer.rollback().await {
            warn!("dropping unanswerable offer: {e}");
        }
        if self.state.fail_offer() {
            if let Err(e) = self.renegotiate().await {
                warn!("follow-up renegotiation failed: {e}");
            }
        }
    }

    async fn renegotiate(&mut self) -> Result<()> {
        let remote = self.remote()?.clone();
        let seq = self.state.begin_offer()?;
        let offer = match self
            .hangups
            .race(Some(&remote), "offer", self.peer.create_offer())
            .await
        {
            Ok(offer) => offer,
            Err(e) => {
                self.state.abandon_offer();
                return Err(e);
            }
        };
        debug!("renegotiation offer #{seq} to {remote}");
        self.channel.send(&SignalingMessage::NegotiationOffer {
            peer: remote,
            offer,
        });
        Ok(())
    }

    async fn answer(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        self.state.begin_answer();
        let answered = self
            .hangups
            .race(
                self.session.remote.as_ref(),
                "answer",
                self.peer.create_answer(offer),
            )
            .await;
        match answered {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.state.abandon_answer();
                Err(e)
            }
        }
    }

    /// Smaller identity yields.
    fn yields_to(&self, remote: &PeerId) -> bool {
        self.session.local_id < *remote
    }

    fn keep_offer(&self, remote: &PeerId) {
        warn!(
            "{}",
            CallError::GlareConflict {
                remote: remote.to_string(),
                resolution: "inbound offer dropped, local offer kept",
            }
        );
    }

    async fn yield_offer(&mut self, remote: &PeerId) -> Result<()> {
        warn!(
            "{}",
            CallError::GlareConflict {
                remote: remote.to_string(),
                resolution: "local offer rolled back",
            }
        );
        self.hangups
            .race(Some(remote), "rollback", self.peer.rollback())
            .await?;
        self.state.abandon_offer();
        Ok(())
    }

    async fn ensure_local_media(&mut self) -> Result<()> {
        if self.session.local_stream.is_some() {
            return Ok(());
        }
        let constraints = MediaConstraints {
            audio: self.constraints.audio,
            video: self.constraints.video && self.session.media.video_enabled,
        };
        let acquired = self
            .hangups
            .race(
                self.session.remote.as_ref(),
                "media acquisition",
                self.media.acquire(constraints),
            )
            .await;
        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                let message = match &e {
                    CallError::MediaAcquisition(m) => m.clone(),
                    other => other.to_string(),
                };
                self.events.emit_media_error(&message);
                return Err(e);
            }
        };
        stream.set_enabled(TrackKind::Audio, self.session.media.audio_enabled);
        stream.set_enabled(TrackKind::Video, self.session.media.video_enabled);
        self.events.emit_local_stream(stream.id());
        self.session.local_stream = Some(stream);
        Ok(())
    }

    async fn attach_local_tracks(&mut self) -> Result<()> {
        if self.session.tracks_attached {
            return Ok(());
        }
        let Some(stream) = self.session.local_stream.clone() else {
            return Err(CallError::media("no local stream to attach"));
        };
        let attached = self
            .hangups
            .race(
                self.session.remote.as_ref(),
                "track attach",
                self.peer.attach_tracks(&stream),
            )
            .await?;
        self.session.tracks_attached = true;
        debug!("attached {attached} local tracks");
        Ok(())
    }

    fn add_remote_track(&mut self, stream_id: String, track: Arc<MediaTrack>) {
        debug!("remote {:?} track {} on {stream_id}", track.kind(), track.id());
        if let Some(stream) = self
            .session
            .remote_stream
            .as_mut()
            .filter(|s| s.id() == stream_id)
        {
            stream.add_track(track);
            return;
        }
        self.events.emit_remote_stream(&stream_id);
        self.session.remote_stream = Some(MediaStream::new(stream_id, vec![track]));
    }

    fn toggle(&mut self, kind: TrackKind, operation: &'static str) -> Result<bool> {
        let phase = self.session.phase;
        if phase.is_terminal() {
            return Err(CallError::InvalidPhase { operation, phase });
        }
        let media = &mut self.session.media;
        let enabled = match kind {
            TrackKind::Audio => {
                media.audio_enabled = !media.audio_enabled;
                media.audio_enabled
            }
            TrackKind::Video => {
                media.video_enabled = !media.video_enabled;
                media.video_enabled
            }
        };
        if let Some(stream) = &self.session.local_stream {
            stream.set_enabled(kind, enabled);
        }
        debug!("{kind:?} enabled: {enabled}");
        Ok(enabled)
    }

    async fn enter_ended(&mut self, reason: EndReason, notify_remote: bool) {
        if self.session.phase.is_terminal() {
            return;
        }
        if notify_remote {
            if let Some(remote) = self.session.remote.clone() {
                self.channel
                    .send(&SignalingMessage::CallEnded { peer: Some(remote) });
            }
        }
        self.release_media();
        self.state.reset();
        if let Err(e) = self.peer.close().await {
            warn!("closing peer connection: {e}");
        }
        self.session.end_reason = Some(reason.clone());
        self.transition(CallPhase::Ended);
        self.events.emit_ended(reason);
    }

    /// Taking the streams out makes a second release impossible.
    fn release_media(&mut self) {
        if let Some(stream) = self.session.local_stream.take() {
            let released = stream.stop_all();
            debug!("released {released} local tracks");
        }
        if let Some(stream) = self.session.remote_stream.take() {
            stream.stop_all();
        }
    }

    fn record_remote(&mut self, peer: PeerId, email: Option<String>) {
        self.events.emit_remote_participant(&peer, email.as_deref());
        self.session.remote = Some(peer);
        self.session.remote_email = email;
    }

    fn remote(&self) -> Result<&PeerId> {
        self.session
            .remote
            .as_ref()
            .ok_or_else(|| CallError::signaling("no remote participant"))
    }

    /// Messages carrying a sender must come from the known counterpart.
    fn check_sender(&self, from: Option<&PeerId>) -> Result<()> {
        match (from, self.session.remote.as_ref()) {
            (Some(from), Some(remote)) if from != remote => Err(CallError::signaling(format!(
                "message from {from}, counterpart is {remote}"
            ))),
            _ => Ok(()),
        }
    }

    fn transition(&mut self, to: CallPhase) {
        let from = self.session.phase;
        if from == to {
            return;
        }
        self.session.phase = to;
        match to {
            CallPhase::Connected => self.session.connected_at = Some(Utc::now()),
            CallPhase::Ended => self.session.ended_at = Some(Utc::now()),
            _ => {}
        }
        self.events.emit_phase(from, to);
    }
}
