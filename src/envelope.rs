//! Message identifiers and mailbox envelopes.
//!
//! A [`MessageId`] is a 64-bit bitfield: a monotonically increasing
//! request-id base plus four flags. Two ids refer to the same request iff
//! their base fields match; the response to request `r` carries `r`'s base
//! with the response bit set.

use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::actor::ActorRef;
use crate::message::Message;

const RESPONSE_FLAG: u64 = 1 << 63;
const ANSWERED_FLAG: u64 = 1 << 62;
const HIGH_PRIORITY_FLAG: u64 = 1 << 61;
const FLOW_CONTROLLED_FLAG: u64 = 1 << 60;
const REQUEST_ID_MASK: u64 = (1 << 60) - 1;

/// 64-bit message id bitfield. The default id (all zeros) denotes an
/// asynchronous message that is neither a request nor a response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(u64);

impl MessageId {
    /// The id of an ordinary asynchronous message.
    pub fn make() -> Self {
        MessageId(0)
    }

    pub(crate) fn from_request_id(base: u64) -> Self {
        debug_assert_eq!(base & !REQUEST_ID_MASK, 0);
        MessageId(base)
    }

    pub(crate) fn flow_controlled() -> Self {
        MessageId(FLOW_CONTROLLED_FLAG)
    }

    /// The request-id base field.
    pub fn request_id(self) -> u64 {
        self.0 & REQUEST_ID_MASK
    }

    /// `true` when this id names a pending request.
    pub fn is_request(self) -> bool {
        self.request_id() != 0 && !self.is_response()
    }

    /// `true` when this envelope answers a prior request.
    pub fn is_response(self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// `true` for plain asynchronous messages (no request in play).
    pub fn is_async(self) -> bool {
        self.request_id() == 0 && !self.is_response()
    }

    pub fn is_answered(self) -> bool {
        self.0 & ANSWERED_FLAG != 0
    }

    pub fn is_high_priority(self) -> bool {
        self.0 & HIGH_PRIORITY_FLAG != 0
    }

    pub fn is_flow_controlled(self) -> bool {
        self.0 & FLOW_CONTROLLED_FLAG != 0
    }

    /// The id a response to this request must carry. Preserves the
    /// priority bit, clears the answered bit.
    pub fn response_id(self) -> Self {
        MessageId(self.request_id() | RESPONSE_FLAG | (self.0 & HIGH_PRIORITY_FLAG))
    }

    pub fn with_high_priority(self) -> Self {
        MessageId(self.0 | HIGH_PRIORITY_FLAG)
    }

    pub(crate) fn mark_answered(&mut self) {
        self.0 |= ANSWERED_FLAG;
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MessageId({}{}{}{}{})",
            self.request_id(),
            if self.is_response() { " rsp" } else { "" },
            if self.is_answered() { " ans" } else { "" },
            if self.is_high_priority() { " hi" } else { "" },
            if self.is_flow_controlled() { " flow" } else { "" },
        )
    }
}

// ── Envelope ────────────────────────────────────────────────────────────

/// A single message in flight: payload, sender, id, and the forwarding
/// stages accumulated by delegation.
///
/// The `next` field is the intrusive link for the mailbox stack and MUST
/// stay first so the mailbox can treat `*mut Envelope` uniformly.
pub struct Envelope {
    pub(crate) next: AtomicPtr<Envelope>,
    /// Strong pointer to the sending actor, when known.
    pub sender: Option<ActorRef>,
    pub mid: MessageId,
    /// Actors this envelope was delegated through, oldest first.
    pub stages: Vec<ActorRef>,
    pub payload: Message,
}

impl Envelope {
    pub fn make(sender: Option<ActorRef>, mid: MessageId, payload: Message) -> Box<Envelope> {
        Box::new(Envelope {
            next: AtomicPtr::new(ptr::null_mut()),
            sender,
            mid,
            stages: Vec::new(),
            payload,
        })
    }

    pub fn is_high_priority(&self) -> bool {
        self.mid.is_high_priority()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("mid", &self.mid)
            .field("payload", &self.payload)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}
