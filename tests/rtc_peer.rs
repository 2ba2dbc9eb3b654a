//! `RtcPeer` against a second `RtcPeer` in the same process. No ICE servers:
//! the two sides pair up over host candidates.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webrtc::media::Sample;

use duocall::peer::adapter::{PeerConnection, PeerNotification};
use duocall::peer::media::{MediaConstraints, MediaTrack};
use duocall::peer::types::SessionDescription;
use duocall::signaling::messages::USER_JOINED;
use duocall::{
    CallConfig, CallError, CallPhase, LoopbackHub, MediaSource, MediaStream, RtcPeer,
    SampleTrackSource, SessionController, SessionSnapshot,
};

const MEDIA_WAIT: Duration = Duration::from_secs(20);

fn offline() -> CallConfig {
    CallConfig {
        ice_servers: vec![],
        ice_gather_timeout_secs: 5,
        ..CallConfig::default()
    }
}

struct Endpoint {
    peer: RtcPeer,
    stream: MediaStream,
    notes: mpsc::UnboundedReceiver<PeerNotification>,
}

async fn endpoint() -> Endpoint {
    let peer = RtcPeer::new(&offline()).await.unwrap();
    let (tx, notes) = mpsc::unbounded_channel();
    peer.bind(Arc::new(move |note: PeerNotification| {
        let _ = tx.send(note);
    }));
    let stream = SampleTrackSource
        .acquire(MediaConstraints::default())
        .await
        .unwrap();
    Endpoint {
        peer,
        stream,
        notes,
    }
}

/// Writes silence into every track of `stream` until aborted.
fn feed(stream: &MediaStream) -> JoinHandle<()> {
    let stream = stream.clone();
    tokio::spawn(async move {
        let sample = Sample {
            data: vec![0u8; 160].into(),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        loop {
            for track in stream.tracks() {
                let _ = track.write_sample(&sample).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

async fn next_remote_track(
    notes: &mut mpsc::UnboundedReceiver<PeerNotification>,
) -> (String, Arc<MediaTrack>) {
    let arrived = timeout(MEDIA_WAIT, async {
        while let Some(note) = notes.recv().await {
            if let PeerNotification::RemoteTrack { stream_id, track } = note {
                return Some((stream_id, track));
            }
        }
        None
    })
    .await;
    arrived
        .expect("no remote track arrived")
        .expect("notifier dropped")
}

fn describes_media(desc: &SessionDescription) -> bool {
    desc.sdp.contains("m=audio") && desc.sdp.contains("m=video")
}

/// Caller `a`, callee `b`; both attach before the first description.
async fn call(a: &Endpoint, b: &Endpoint) {
    assert_eq!(a.peer.attach_tracks(&a.stream).await.unwrap(), 2);
    let offer = a.peer.create_offer().await.unwrap();
    assert_eq!(b.peer.attach_tracks(&b.stream).await.unwrap(), 2);
    let answer = b.peer.create_answer(&offer).await.unwrap();
    assert!(describes_media(&answer));
    a.peer.apply_remote_answer(&answer).await.unwrap();
}

#[tokio::test]
async fn call_offer_carries_the_attached_tracks() {
    let a = endpoint().await;
    let mut b = endpoint().await;

    a.peer.attach_tracks(&a.stream).await.unwrap();
    let offer = a.peer.create_offer().await.unwrap();
    assert!(describes_media(&offer));
    assert!(offer.sdp.contains("a=ice-ufrag"));

    b.peer.attach_tracks(&b.stream).await.unwrap();
    let answer = b.peer.create_answer(&offer).await.unwrap();
    a.peer.apply_remote_answer(&answer).await.unwrap();

    let feeding = feed(&a.stream);
    let (stream_id, _track) = next_remote_track(&mut b.notes).await;
    assert_eq!(stream_id, a.stream.id());
    feeding.abort();

    a.peer.close().await.unwrap();
    b.peer.close().await.unwrap();
}

#[tokio::test]
async fn stray_answer_is_a_signaling_error() {
    let a = endpoint().await;
    let answer = SessionDescription::answer("v=0\r\n");
    assert!(matches!(
        a.peer.apply_remote_answer(&answer).await,
        Err(CallError::SignalingState(_))
    ));
    // nothing outstanding, nothing to drop
    a.peer.rollback().await.unwrap();
    a.peer.close().await.unwrap();
}

#[tokio::test]
async fn renegotiation_round_after_the_call() {
    let a = endpoint().await;
    let b = endpoint().await;
    call(&a, &b).await;

    let offer = a.peer.create_offer().await.unwrap();
    assert!(describes_media(&offer));
    let answer = b.peer.create_answer(&offer).await.unwrap();
    a.peer.apply_remote_answer(&answer).await.unwrap();

    // and the other way round
    let offer = b.peer.create_offer().await.unwrap();
    let answer = a.peer.create_answer(&offer).await.unwrap();
    b.peer.apply_remote_answer(&answer).await.unwrap();

    a.peer.close().await.unwrap();
    b.peer.close().await.unwrap();
}

#[tokio::test]
async fn crossing_call_offers_rebuild_the_yielding_side() {
    let mut a = endpoint().await;
    let b = endpoint().await;
    a.peer.attach_tracks(&a.stream).await.unwrap();
    b.peer.attach_tracks(&b.stream).await.unwrap();
    let _dropped = a.peer.create_offer().await.unwrap();
    let kept = b.peer.create_offer().await.unwrap();

    a.peer.rollback().await.unwrap();
    let answer = a.peer.create_answer(&kept).await.unwrap();
    assert!(describes_media(&answer));
    b.peer.apply_remote_answer(&answer).await.unwrap();

    let feeding = feed(&b.stream);
    let (stream_id, _track) = next_remote_track(&mut a.notes).await;
    assert_eq!(stream_id, b.stream.id());
    feeding.abort();

    a.peer.close().await.unwrap();
    b.peer.close().await.unwrap();
}

#[tokio::test]
async fn crossing_renegotiation_offers_settle_without_native_rollback() {
    let a = endpoint().await;
    let b = endpoint().await;
    call(&a, &b).await;

    let _dropped = a.peer.create_offer().await.unwrap();
    let kept = b.peer.create_offer().await.unwrap();

    a.peer.rollback().await.unwrap();
    let answer = a.peer.create_answer(&kept).await.unwrap();
    b.peer.apply_remote_answer(&answer).await.unwrap();

    // the yielding side's follow-up
    let offer = a.peer.create_offer().await.unwrap();
    let answer = b.peer.create_answer(&offer).await.unwrap();
    a.peer.apply_remote_answer(&answer).await.unwrap();

    a.peer.close().await.unwrap();
    b.peer.close().await.unwrap();
}

async fn rtc_session(hub: &Arc<LoopbackHub>, id: &str) -> SessionController {
    let config = offline();
    let channel = hub.join(id, &format!("{id}@example.org"));
    let peer = RtcPeer::new(&config).await.unwrap();
    SessionController::start(id, channel, peer, SampleTrackSource, &config)
}

async fn until(
    controller: &SessionController,
    what: &str,
    cond: impl FnMut(&SessionSnapshot) -> bool,
) {
    let mut rx = controller.watch();
    let reached = timeout(MEDIA_WAIT, rx.wait_for(cond)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "{} never reached: {what}",
        controller.local_id()
    );
}

async fn media_flows_both_ways(alice: &SessionController, bob: &SessionController) {
    until(alice, "connected", |s| s.phase == CallPhase::Connected).await;
    until(bob, "connected", |s| s.phase == CallPhase::Connected).await;

    let feeding = [
        feed(&alice.local_stream().unwrap()),
        feed(&bob.local_stream().unwrap()),
    ];
    for side in [alice, bob] {
        until(side, "remote audio and video", |s| {
            s.remote_stream
                .as_ref()
                .is_some_and(|r| r.tracks().len() == 2)
        })
        .await;
    }
    for task in feeding {
        task.abort();
    }
}

#[tokio::test]
async fn sessions_on_rtc_peers_exchange_media() {
    let hub = LoopbackHub::new();
    let alice = rtc_session(&hub, "alice").await;
    let bob = rtc_session(&hub, "bob").await;
    until(&alice, "bob joined", |s| s.remote_participant_known()).await;

    alice.initiate_call().await.unwrap();
    media_flows_both_ways(&alice, &bob).await;
    assert_eq!(alice.snapshot().offers_sent, 1);

    alice.end_call().await.unwrap();
    until(&bob, "ended", |s| s.phase == CallPhase::Ended).await;
}

#[tokio::test]
async fn crossing_calls_on_rtc_peers_still_connect() {
    let hub = LoopbackHub::new();
    let alice = rtc_session(&hub, "alice").await;
    let bob_channel = hub.join("bob", "bob@example.org");
    let config = offline();
    let bob = SessionController::start(
        "bob",
        bob_channel.clone(),
        RtcPeer::new(&config).await.unwrap(),
        SampleTrackSource,
        &config,
    );
    bob_channel.deliver(
        USER_JOINED,
        serde_json::json!({"email": "alice@example.org", "id": "alice"}),
    );
    until(&alice, "bob joined", |s| s.remote_participant_known()).await;
    until(&bob, "alice known", |s| s.remote_participant_known()).await;

    let (a, b) = tokio::join!(alice.initiate_call(), bob.initiate_call());
    for result in [a, b] {
        match result {
            Ok(()) | Err(CallError::InvalidPhase { .. }) => {}
            Err(other) => panic!("unexpected initiate error: {other}"),
        }
    }
    media_flows_both_ways(&alice, &bob).await;
}
