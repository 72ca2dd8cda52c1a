//! Attach hooks: monitors, links, and cleanup functors.
//!
//! Every control block carries a list of hooks fired exactly once when the
//! actor terminates. Monitors translate into a [`DownMsg`] at the
//! observer, links into an [`ExitMsg`], and functor hooks run arbitrary
//! cleanup (the stream del-source handshake uses one). Attaching to an
//! already-dead actor fires the hook immediately.

use crate::actor::{ActorAddr, ActorRef};
use crate::envelope::{Envelope, MessageId};
use crate::error::ExitReason;
use crate::message::{DownMsg, ExitMsg, Message};

/// What an observer hook reports as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserveKind {
    /// Unidirectional death notification ([`DownMsg`]).
    Monitor,
    /// Link half: the peer receives an [`ExitMsg`].
    Link,
}

pub(crate) enum Hook {
    Observer {
        observer: ActorAddr,
        kind: ObserveKind,
    },
    Cleanup(Box<dyn FnOnce(&ExitReason) + Send>),
}

/// Hook list plus the recorded exit reason once the actor died.
pub(crate) struct AttachState {
    hooks: Vec<Hook>,
    exit: Option<ExitReason>,
}

impl AttachState {
    pub(crate) fn new() -> Self {
        AttachState {
            hooks: Vec::new(),
            exit: None,
        }
    }
}

/// Attach an observer hook to `peer`. Monitors stack (each call is an
/// independent monitor); links are deduplicated.
pub(crate) fn attach_observer(peer: &ActorRef, observer: ActorAddr, kind: ObserveKind) {
    let fire_now = {
        let mut st = peer.attach.lock().unwrap_or_else(|e| e.into_inner());
        match &st.exit {
            Some(reason) => Some(reason.clone()),
            None => {
                let duplicate = kind == ObserveKind::Link
                    && st.hooks.iter().any(|h| {
                        matches!(h, Hook::Observer { observer: o, kind: k }
                            if *k == ObserveKind::Link && *o == observer)
                    });
                if !duplicate {
                    st.hooks.push(Hook::Observer {
                        observer: observer.clone(),
                        kind,
                    });
                }
                None
            }
        }
    };
    if let Some(reason) = fire_now {
        fire_hook(
            Hook::Observer { observer, kind },
            &peer.addr(),
            &reason,
        );
    }
}

/// Remove one observer hook from `peer`.
pub(crate) fn detach_observer(peer: &ActorRef, observer: &ActorAddr, kind: ObserveKind) {
    let mut st = peer.attach.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(pos) = st.hooks.iter().position(|h| {
        matches!(h, Hook::Observer { observer: o, kind: k } if *k == kind && o == observer)
    }) {
        st.hooks.remove(pos);
    }
}

/// Attach a cleanup functor to `peer`, run with its exit reason. If the
/// peer already exited, the functor runs immediately.
pub(crate) fn attach_cleanup(peer: &ActorRef, f: Box<dyn FnOnce(&ExitReason) + Send>) {
    let mut st = peer.attach.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(reason) = st.exit.clone() {
        drop(st);
        f(&reason);
        return;
    }
    st.hooks.push(Hook::Cleanup(f));
}

/// Record the exit reason and fire every hook exactly once. Called from
/// cleanup; subsequent attaches fire immediately against the recorded
/// reason.
pub(crate) fn fire_hooks(cell: &ActorRef, reason: ExitReason) {
    let hooks = {
        let mut st = cell.attach.lock().unwrap_or_else(|e| e.into_inner());
        if st.exit.is_some() {
            return;
        }
        st.exit = Some(reason.clone());
        std::mem::take(&mut st.hooks)
    };
    let source = cell.addr();
    for hook in hooks {
        fire_hook(hook, &source, &reason);
    }
}

fn fire_hook(hook: Hook, source: &ActorAddr, reason: &ExitReason) {
    match hook {
        Hook::Observer {
            observer,
            kind: ObserveKind::Monitor,
        } => {
            if let Some(target) = observer.upgrade() {
                target.enqueue(Envelope::make(
                    None,
                    MessageId::make(),
                    Message::new(DownMsg {
                        source: source.clone(),
                        reason: reason.clone(),
                    }),
                ));
            }
        }
        Hook::Observer {
            observer,
            kind: ObserveKind::Link,
        } => {
            if let Some(target) = observer.upgrade() {
                target.enqueue(Envelope::make(
                    None,
                    MessageId::make(),
                    Message::new(ExitMsg {
                        source: source.clone(),
                        reason: reason.clone(),
                    }),
                ));
            }
        }
        Hook::Cleanup(f) => f(reason),
    }
}
