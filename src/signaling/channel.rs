use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::signaling::messages::SignalingMessage;

/// The external, ordered, per-client message bus (e.g. a WebSocket event bus).
pub trait MessageBus: Send + Sync + 'static {
    /// Hands an event to the transport. `false` means it was dropped.
    fn emit(&self, event: &'static str, payload: Value) -> bool;
}

pub type Handler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Typed send/receive wrapper over a [`MessageBus`].
///
/// Inbound traffic enters through [`SignalingChannel::deliver`], which the
/// transport calls once per received event, in arrival order.
pub struct SignalingChannel {
    bus: Box<dyn MessageBus>,
    handlers: Mutex<Vec<(SubscriptionId, &'static str, Handler)>>,
    next_id: AtomicU64,
}

impl SignalingChannel {
    pub fn new(bus: impl MessageBus) -> Self {
        Self {
            bus: Box::new(bus),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fire-and-forget.
    pub fn send(&self, message: &SignalingMessage) {
        let (event, payload) = message.encode();
        if self.bus.emit(event, payload) {
            debug!("sent {event}");
        } else {
            debug!("{event} dropped by the bus");
        }
    }

    pub fn subscribe(&self, event: &'static str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, event, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(sid, _, _)| *sid != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Decodes one inbound event and hands it to the matching handlers.
    pub fn deliver(&self, event: &str, payload: Value) {
        let targets: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, name, _)| *name == event)
            .map(|(_, _, handler)| handler.clone())
            .collect();
        if targets.is_empty() {
            debug!("no subscriber for {event}, dropping");
            return;
        }
        match SignalingMessage::decode(event, payload) {
            Ok(message) => {
                for handler in targets {
                    handler(message.clone());
                }
            }
            Err(e) => warn!("dropping inbound {event}: {e}"),
        }
    }
}
