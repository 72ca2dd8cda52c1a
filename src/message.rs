//! Type-erased message payloads and the reserved system payload shapes.
//!
//! A [`Message`] owns a single clonable payload behind `dyn Any`. Handlers
//! match by downcasting; the empty message stands in for a unit reply.
//!
//! The system payload types at the bottom of this module are reserved for
//! the runtime: user code must not synthesize them. They are routed by the
//! dispatch pipeline before any behavior sees an envelope.

use std::any::Any;
use std::fmt;

use crate::actor::ActorAddr;
use crate::error::{Error, ExitReason};

/// Object-safe payload bound: `Any + Send + Clone` for type erasure with
/// copy-on-broadcast support.
pub(crate) trait Payload: Any + Send {
    fn clone_boxed(&self) -> Box<dyn Payload>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Clone> Payload for T {
    fn clone_boxed(&self) -> Box<dyn Payload> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A type-erased, clonable message payload.
pub struct Message {
    inner: Option<Box<dyn Payload>>,
}

impl Message {
    /// Wrap a payload value.
    pub fn new<T: Any + Send + Clone>(value: T) -> Self {
        Message {
            inner: Some(Box::new(value)),
        }
    }

    /// The empty message, used as a unit reply.
    pub fn unit() -> Self {
        Message { inner: None }
    }

    /// `true` if this is the empty (unit) message.
    pub fn is_unit(&self) -> bool {
        self.inner.is_none()
    }

    /// `true` if the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|p| p.as_any().is::<T>())
    }

    /// Borrow the payload as a `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the payload as a `T`.
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.inner.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    /// Take the payload out as a `T`, leaving the unit message behind.
    /// Returns `None` (and leaves the payload in place) on a type
    /// mismatch.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }
        let boxed = self.inner.take()?;
        match boxed.into_any().downcast::<T>() {
            Ok(v) => Some(*v),
            // is::<T> held above, so the downcast cannot fail.
            Err(_) => None,
        }
    }

    /// Replace this message with the unit message, returning the previous
    /// contents.
    pub fn take_message(&mut self) -> Message {
        Message {
            inner: self.inner.take(),
        }
    }

    /// Name of the payload type, for logging.
    pub fn payload_type(&self) -> &'static str {
        self.inner.as_ref().map_or("()", |p| p.type_name())
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Message {
            inner: self.inner.as_ref().map(|p| p.clone_boxed()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&self.payload_type()).finish()
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::unit()
    }
}

// ── Reserved system payloads ────────────────────────────────────────────

/// `(sys, get, key)` — run-time meta information request. The only key
/// served by the core is `"info"`; anything else answers
/// [`Error::UnsupportedSysKey`].
#[derive(Debug, Clone)]
pub struct SysRequest {
    pub key: String,
}

/// Reply to `(sys, get, "info")`: the actor's address and name.
#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub ctrl: ActorAddr,
    pub name: String,
}

/// `(sys, add-source)` — stream handshake: the sender registers itself as
/// an upstream source at the receiving sink.
#[derive(Debug, Clone)]
pub struct AddSource;

/// `(sys, del-source, addr)` — a previously registered source terminated;
/// fired at the sink by the source's cleanup hook.
#[derive(Debug, Clone)]
pub struct DelSource {
    pub source: ActorAddr,
}

/// `(sys, get, n)` — credit grant from a sink to a source: produce and
/// send `amount` flow-controlled messages.
#[derive(Debug, Clone)]
pub struct CreditGrant {
    pub amount: u64,
}

/// Timeout self-send. Only the owning actor may produce this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutMsg {
    pub id: u32,
}

/// Exit notification from a linked actor.
#[derive(Debug, Clone)]
pub struct ExitMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Death notification delivered to a monitoring actor.
#[derive(Debug, Clone)]
pub struct DownMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Convenience: wrap an [`Error`] as a message payload.
impl From<Error> for Message {
    fn from(e: Error) -> Self {
        Message::new(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_round_trip() {
        let mut m = Message::new(42_u64);
        assert!(m.is::<u64>());
        assert!(!m.is::<u32>());
        assert_eq!(m.get::<u64>(), Some(&42));
        assert_eq!(m.take::<u64>(), Some(42));
        assert!(m.is_unit());
    }

    #[test]
    fn take_leaves_payload_on_mismatch() {
        let mut m = Message::new("hello");
        assert_eq!(m.take::<u64>(), None);
        assert!(m.is::<&str>());
    }

    #[test]
    fn clone_is_deep() {
        let m = Message::new(vec![1, 2, 3]);
        let mut c = m.clone();
        c.get_mut::<Vec<i32>>().unwrap().push(4);
        assert_eq!(m.get::<Vec<i32>>().unwrap().len(), 3);
    }
}
