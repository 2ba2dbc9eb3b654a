#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duocall::error::{CallError, Result};
use duocall::peer::adapter::{Notifier, PeerConnection, PeerNotification};
use duocall::peer::media::{MediaConstraints, MediaSource, MediaStream, MediaTrack, TrackKind};
use duocall::peer::types::SessionDescription;
use duocall::signaling::{MessageBus, SignalingChannel};
use duocall::{CallPhase, SessionController, SessionSnapshot};

const WAIT: Duration = Duration::from_secs(3);

/// Scripted peer connection. Tracks the signaling state the way a native
/// peer connection would and counts every call.
#[derive(Clone, Default)]
pub struct FakePeer {
    inner: Arc<FakePeerInner>,
}

#[derive(Default)]
struct FakePeerInner {
    notifier: Mutex<Option<Notifier>>,
    have_local_offer: AtomicBool,
    negotiated: AtomicBool,
    reject_answers: AtomicBool,
    fail_attach: AtomicBool,
    offers: AtomicUsize,
    overlapping_offers: AtomicUsize,
    answers: AtomicUsize,
    applied_answers: AtomicUsize,
    rollbacks: AtomicUsize,
    attached: AtomicUsize,
    attach_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl FakePeer {
    /// Raises a notification as the native connection would.
    pub fn notify(&self, notification: PeerNotification) {
        let notifier = self.inner.notifier.lock().unwrap().clone();
        if let Some(notify) = notifier {
            notify(notification);
        }
    }

    /// Makes `apply_remote_answer` fail as it would on unparsable SDP.
    pub fn reject_answers(&self, reject: bool) {
        self.inner.reject_answers.store(reject, Ordering::SeqCst);
    }

    pub fn fail_attach(&self, fail: bool) {
        self.inner.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn has_local_offer(&self) -> bool {
        self.inner.have_local_offer.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> usize {
        self.inner.offers.load(Ordering::SeqCst)
    }

    pub fn overlapping_offers(&self) -> usize {
        self.inner.overlapping_offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.inner.answers.load(Ordering::SeqCst)
    }

    pub fn applied_answers(&self) -> usize {
        self.inner.applied_answers.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn attached(&self) -> usize {
        self.inner.attached.load(Ordering::SeqCst)
    }

    pub fn attach_calls(&self) -> usize {
        self.inner.attach_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn bind(&self, notify: Notifier) {
        *self.inner.notifier.lock().unwrap() = Some(notify);
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.inner.have_local_offer.swap(true, Ordering::SeqCst) {
            self.inner.overlapping_offers.fetch_add(1, Ordering::SeqCst);
        }
        let n = self.inner.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if self.has_local_offer() {
            return Err(CallError::signaling(
                "remote offer while have-local-offer",
            ));
        }
        self.inner.answers.fetch_add(1, Ordering::SeqCst);
        self.inner.negotiated.store(true, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer-to-{}", offer.sdp)))
    }

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<()> {
        if !self.has_local_offer() {
            return Err(CallError::signaling("answer in stable state"));
        }
        if self.inner.reject_answers.load(Ordering::SeqCst) {
            return Err(CallError::signaling(format!("unparsable answer {}", answer.sdp)));
        }
        self.inner.have_local_offer.store(false, Ordering::SeqCst);
        self.inner.negotiated.store(true, Ordering::SeqCst);
        self.inner.applied_answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.have_local_offer.store(false, Ordering::SeqCst);
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_tracks(&self, stream: &MediaStream) -> Result<usize> {
        self.inner.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_attach.load(Ordering::SeqCst) {
            return Err(CallError::media("track ended before it could be sent"));
        }
        let n = stream.tracks().len();
        self.inner.attached.fetch_add(n, Ordering::SeqCst);
        // tracks added before the first exchange ride in it
        if self.inner.negotiated.load(Ordering::SeqCst) {
            for _ in 0..n {
                self.notify(PeerNotification::NegotiationNeeded);
            }
        }
        Ok(n)
    }

    async fn close(&self) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Media double: detached tracks, a permission error, or a prompt nobody
/// ever answers.
#[derive(Clone, Default)]
pub struct FakeMedia {
    denied: bool,
    stalled: bool,
    requested: Arc<Mutex<Vec<MediaConstraints>>>,
}

impl FakeMedia {
    pub fn granted() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    pub fn requested(&self) -> Vec<MediaConstraints> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        self.requested.lock().unwrap().push(constraints);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if self.denied {
            return Err(CallError::media("permission denied"));
        }
        let mut stream = MediaStream::new("local-stream", vec![]);
        if constraints.audio {
            stream.add_track(Arc::new(MediaTrack::detached(TrackKind::Audio)));
        }
        if constraints.video {
            stream.add_track(Arc::new(MediaTrack::detached(TrackKind::Video)));
        }
        Ok(stream)
    }
}

/// Bus that keeps every outbound event.
#[derive(Clone, Default)]
pub struct RecordingBus {
    sent: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingBus {
    pub fn sent(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent(event).len()
    }
}

impl MessageBus for RecordingBus {
    fn emit(&self, event: &'static str, payload: Value) -> bool {
        self.sent.lock().unwrap().push((event.to_owned(), payload));
        true
    }
}

pub fn recording_channel() -> (Arc<SignalingChannel>, RecordingBus) {
    let bus = RecordingBus::default();
    (Arc::new(SignalingChannel::new(bus.clone())), bus)
}

/// Returns once every input queued before this call has been handled.
pub async fn barrier(controller: &SessionController) {
    let _ = controller.toggle_mute().await;
    let _ = controller.toggle_mute().await;
}

pub async fn wait_until(
    controller: &SessionController,
    what: &str,
    cond: impl FnMut(&SessionSnapshot) -> bool,
) {
    let mut rx = controller.watch();
    let result = tokio::time::timeout(WAIT, rx.wait_for(cond)).await;
    assert!(
        matches!(result, Ok(Ok(_))),
        "{} never reached: {what}",
        controller.local_id()
    );
}

pub async fn wait_for_phase(controller: &SessionController, phase: CallPhase) {
    wait_until(controller, &phase.to_string(), |s| s.phase == phase).await;
}

/// Polls `cond` until it holds.
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never held: {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
