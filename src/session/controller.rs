//! The session task and its handle.
//!
//! Signaling handlers, peer-connection callbacks and controller commands all
//! feed one FIFO mailbox; a single task drains it, handling each input to
//! completion before the next. Hang-ups (`end_call`, leaving, `call:ended`,
//! transport failure) use a second lane that is served first and may cut the
//! current input short.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{CallEvent, EndReason, Emitter};
use crate::negotiation::{CallPhase, Hangup, NegotiationCoordinator};
use crate::peer::adapter::{PeerConnection, PeerNotification};
use crate::peer::media::{MediaSource, MediaStream, MediaStreamState};
use crate::peer::types::PeerId;
use crate::session::state::SessionSnapshot;
use crate::signaling::messages::INBOUND_EVENTS;
use crate::signaling::{SignalingChannel, SignalingMessage, SubscriptionId};

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    InitiateCall(Reply<()>),
    ToggleMute(Reply<bool>),
    ToggleVideo(Reply<bool>),
}

pub(crate) enum SessionInput {
    Signal(SignalingMessage),
    Peer(PeerNotification),
    Command(Command),
}

/// Handle to one call session. Dropping it ends the call.
pub struct SessionController {
    local_id: PeerId,
    tx: mpsc::UnboundedSender<SessionInput>,
    hangups: mpsc::UnboundedSender<Hangup>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: Emitter,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Subscribes to the channel, binds the peer connection and spawns the
    /// session task. Must be called inside a tokio runtime.
    pub fn start<P, M>(
        local_id: impl Into<PeerId>,
        channel: Arc<SignalingChannel>,
        peer: P,
        media: M,
        config: &CallConfig,
    ) -> Self
    where
        P: PeerConnection,
        M: MediaSource,
    {
        let local_id = local_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (hangups, hangup_rx) = mpsc::unbounded_channel();
        let events = Emitter::new();

        let subscriptions: Vec<SubscriptionId> = INBOUND_EVENTS
            .iter()
            .map(|&event| {
                let tx = tx.clone();
                let hangups = hangups.clone();
                channel.subscribe(
                    event,
                    Arc::new(move |message: SignalingMessage| match message {
                        SignalingMessage::CallEnded { peer } => {
                            let _ = hangups.send(Hangup::Remote(peer));
                        }
                        message => {
                            let _ = tx.send(SessionInput::Signal(message));
                        }
                    }),
                )
            })
            .collect();

        let notify_tx = tx.clone();
        let notify_hangups = hangups.clone();
        peer.bind(Arc::new(move |notification: PeerNotification| {
            match notification {
                PeerNotification::ConnectionFailed(reason) => {
                    let _ = notify_hangups.send(Hangup::Failed(reason));
                }
                notification => {
                    let _ = notify_tx.send(SessionInput::Peer(notification));
                }
            }
        }));

        let coordinator = NegotiationCoordinator::new(
            local_id.clone(),
            peer,
            media,
            channel.clone(),
            events.clone(),
            config.media,
            hangup_rx,
        );
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::initial(local_id.clone()));
        let span = info_span!("session", id = %local_id);
        let task = tokio::spawn(
            run(coordinator, rx, channel, subscriptions, snapshot_tx).instrument(span),
        );

        Self {
            local_id,
            tx,
            hangups,
            snapshot,
            events,
            task: Some(task),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Only valid in `AwaitingUserConfirmation`.
    pub async fn initiate_call(&self) -> Result<()> {
        self.request(Command::InitiateCall).await
    }

    /// Flips the audio flag; returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(Command::ToggleMute).await
    }

    /// Flips the video flag; returns the new value.
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(Command::ToggleVideo).await
    }

    /// Idempotent. Does not wait for media or negotiation steps in flight.
    pub async fn end_call(&self) -> Result<()> {
        let (done, ended) = oneshot::channel();
        self.hangups
            .send(Hangup::Local {
                reason: EndReason::LocalHangup,
                done: Some(done),
            })
            .map_err(|_| CallError::SessionClosed)?;
        ended.await.map_err(|_| CallError::SessionClosed)
    }

    pub fn phase(&self) -> CallPhase {
        self.snapshot.borrow().phase
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.snapshot.borrow().remote_stream.clone()
    }

    pub fn remote_participant_known(&self) -> bool {
        self.snapshot.borrow().remote_participant_known()
    }

    pub fn media_state(&self) -> MediaStreamState {
        self.snapshot.borrow().media
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Ends the call as if dropped and waits for the session task to finish.
    pub async fn leave(mut self) {
        self.send_leave();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionInput::Command(command(reply)))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }
}

impl SessionController {
    fn send_leave(&self) {
        // fails harmlessly if the task already stopped
        let _ = self.hangups.send(Hangup::Local {
            reason: EndReason::Left,
            done: None,
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.send_leave();
    }
}

async fn run<P, M>(
    mut coordinator: NegotiationCoordinator<P, M>,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
    channel: Arc<SignalingChannel>,
    subscriptions: Vec<SubscriptionId>,
    snapshot: watch::Sender<SessionSnapshot>,
) where
    P: PeerConnection,
    M: MediaSource,
{
    'inbox: loop {
        tokio::select! {
            biased;
            Some(hangup) = coordinator.next_hangup() => {
                if !end(&mut coordinator, hangup, &snapshot).await {
                    break 'inbox;
                }
            }
            input = rx.recv() => {
                let Some(input) = input else {
                    break 'inbox;
                };
                match input {
                    SessionInput::Signal(message) => coordinator.handle_signal(message).await,
                    SessionInput::Peer(notification) => {
                        coordinator.handle_notification(notification).await
                    }
                    SessionInput::Command(command) => {
                        serve(&mut coordinator, command, &snapshot).await
                    }
                }
                snapshot.send_replace(coordinator.snapshot());
                if let Some(hangup) = coordinator.take_cut_in() {
                    if !end(&mut coordinator, hangup, &snapshot).await {
                        break 'inbox;
                    }
                }
            }
        }
    }

    for id in subscriptions {
        channel.unsubscribe(id);
    }
    debug!("session task stopped");
}

/// Handles one hang-up and publishes the result. Returns `false` when the
/// owner left and the task should stop.
async fn end<P, M>(
    coordinator: &mut NegotiationCoordinator<P, M>,
    hangup: Hangup,
    snapshot: &watch::Sender<SessionSnapshot>,
) -> bool
where
    P: PeerConnection,
    M: MediaSource,
{
    let leaving = matches!(
        hangup,
        Hangup::Local {
            reason: EndReason::Left,
            ..
        }
    );
    let done = coordinator.hang_up(hangup).await;
    snapshot.send_replace(coordinator.snapshot());
    if let Some(done) = done {
        let _ = done.send(());
    }
    !leaving
}

/// Publishes the new snapshot before replying, so a caller that awaited the
/// command observes its effect.
async fn serve<P, M>(
    coordinator: &mut NegotiationCoordinator<P, M>,
    command: Command,
    snapshot: &watch::Sender<SessionSnapshot>,
) where
    P: PeerConnection,
    M: MediaSource,
{
    match command {
        Command::InitiateCall(reply) => {
            let result = coordinator.initiate_call().await;
            snapshot.send_replace(coordinator.snapshot());
            let _ = reply.send(result);
        }
        Command::ToggleMute(reply) => {
            let result = coordinator.toggle_mute();
            snapshot.send_replace(coordinator.snapshot());
            let _ = reply.send(result);
        }
        Command::ToggleVideo(reply) => {
            let result = coordinator.toggle_video();
            snapshot.send_replace(coordinator.snapshot());
            let _ = reply.send(result);
        }
    }
}
