//! Bidirectional links and exit messaging.
//!
//! Linking two actors attaches a link observer on each side: whichever
//! dies first delivers an [`ExitMsg`] to the survivor. Receiving an exit
//! message removes the surviving half of the link before the handler runs,
//! so propagation cannot loop.

use std::sync::Arc;

use crate::actor::{ActorAddr, ActorRef};
use crate::envelope::{Envelope, MessageId};
use crate::error::ExitReason;
use crate::message::{ExitMsg, Message};
use crate::monitor::{self, ObserveKind};

/// Establish a bidirectional link. Self-links are ignored; duplicate
/// links collapse.
pub(crate) fn link(cell: &ActorRef, peer: &ActorRef) {
    if Arc::ptr_eq(cell, peer) {
        return;
    }
    monitor::attach_observer(peer, cell.addr(), ObserveKind::Link);
    monitor::attach_observer(cell, peer.addr(), ObserveKind::Link);
}

/// Dissolve both halves of a link.
pub(crate) fn unlink(cell: &ActorRef, peer: &ActorAddr) {
    monitor::detach_observer(cell, peer, ObserveKind::Link);
    if let Some(peer) = peer.upgrade() {
        monitor::detach_observer(&peer, &cell.addr(), ObserveKind::Link);
    }
}

/// Deliver an exit message to `dest`. The kill sentinel
/// ([`ExitReason::Kill`]) terminates the receiver unconditionally; other
/// reasons go through its exit handler.
pub fn send_exit(from: &ActorAddr, dest: &ActorRef, reason: ExitReason) {
    dest.enqueue(Envelope::make(
        None,
        MessageId::make(),
        Message::new(ExitMsg {
            source: from.clone(),
            reason,
        }),
    ));
}
