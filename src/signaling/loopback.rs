//! In-process signaling bus: every member gets a [`SignalingChannel`], and
//! outbound events are routed to their `to` member the way the socket server
//! relays them (`to` becomes `from`, `user:call` arrives as `incomming:call`,
//! `peer:nego:done` as `peer:nego:final`).

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

use crate::peer::types::PeerId;
use crate::signaling::channel::{MessageBus, SignalingChannel};
use crate::signaling::messages::{INCOMING_CALL, NEGO_DONE, NEGO_FINAL, USER_CALL, USER_JOINED};

#[derive(Default)]
pub struct LoopbackHub {
    members: Mutex<HashMap<PeerId, Arc<SignalingChannel>>>,
}

struct LoopbackBus {
    hub: Weak<LoopbackHub>,
    from: PeerId,
}

impl MessageBus for LoopbackBus {
    fn emit(&self, event: &'static str, payload: Value) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.route(&self.from, event, payload),
            None => false,
        }
    }
}

fn relayed_name(event: &'static str) -> &'static str {
    match event {
        USER_CALL => INCOMING_CALL,
        NEGO_DONE => NEGO_FINAL,
        other => other,
    }
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `id` and announces it to everyone already present.
    pub fn join(self: &Arc<Self>, id: impl Into<PeerId>, email: &str) -> Arc<SignalingChannel> {
        let id = id.into();
        let channel = Arc::new(SignalingChannel::new(LoopbackBus {
            hub: Arc::downgrade(self),
            from: id.clone(),
        }));
        let present: Vec<Arc<SignalingChannel>> = {
            let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
            let present = members.values().cloned().collect();
            members.insert(id.clone(), channel.clone());
            present
        };
        for member in present {
            member.deliver(USER_JOINED, json!({"email": email, "id": id}));
        }
        channel
    }

    /// Later sends addressed to `id` are dropped.
    pub fn leave(&self, id: &PeerId) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn route(&self, from: &PeerId, event: &'static str, payload: Value) -> bool {
        let Value::Object(mut body) = payload else {
            return false;
        };
        let Some(to) = body.remove("to").and_then(|v| v.as_str().map(PeerId::new)) else {
            debug!("{event} from {from} has no recipient");
            return false;
        };
        let target = self
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned();
        let Some(target) = target else {
            debug!("{event} for {to} dropped, not in the room");
            return false;
        };
        body.insert("from".into(), json!(from));
        target.deliver(relayed_name(event), Value::Object(body));
        true
    }
}
