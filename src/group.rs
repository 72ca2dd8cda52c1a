//! Group contract and the local implementation.
//!
//! The core only consumes the [`Group`] trait: subscribe on `join`,
//! unsubscribe on `leave` and on cleanup. [`LocalGroup`] is the in-process
//! implementation with broadcast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::actor::{ActorAddr, ActorId, ActorRef};
use crate::envelope::{Envelope, MessageId};
use crate::message::Message;

/// Group membership contract consumed by the core.
pub trait Group: Send + Sync {
    fn name(&self) -> &str;

    /// Add a member. Returns `false` if the group refused the
    /// subscription.
    fn subscribe(&self, who: ActorRef) -> bool;

    /// Remove a member. Unknown members are ignored.
    fn unsubscribe(&self, who: &ActorAddr);

    /// Deliver a copy of `payload` to every current member.
    fn broadcast(&self, sender: Option<ActorRef>, payload: Message);
}

/// In-process group.
pub struct LocalGroup {
    name: String,
    members: Mutex<HashMap<ActorId, ActorRef>>,
}

impl LocalGroup {
    pub fn new(name: impl Into<String>) -> Arc<LocalGroup> {
        Arc::new(LocalGroup {
            name: name.into(),
            members: Mutex::new(HashMap::new()),
        })
    }

    pub fn member_count(&self) -> usize {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.len()
    }
}

impl Group for LocalGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, who: ActorRef) -> bool {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.insert(who.id(), who);
        true
    }

    fn unsubscribe(&self, who: &ActorAddr) {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.remove(&who.id());
    }

    fn broadcast(&self, sender: Option<ActorRef>, payload: Message) {
        let members: Vec<ActorRef> = {
            let m = self.members.lock().unwrap_or_else(|e| e.into_inner());
            m.values().cloned().collect()
        };
        for member in members {
            member.enqueue(Envelope::make(
                sender.clone(),
                MessageId::make(),
                payload.clone(),
            ));
        }
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("name", &self.name)
            .field("members", &self.member_count())
            .finish()
    }
}
