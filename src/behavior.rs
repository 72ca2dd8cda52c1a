//! Behaviors: the message-handler sets an actor matches envelopes against.
//!
//! A [`Behavior`] is a cheap-clone handle to an ordered list of cases plus
//! an optional idle timeout. Cases are tried in declaration order; the
//! first one whose payload type matches decides the outcome. Invoking a
//! handler yields one of value / error / no-match / skip, which the
//! dispatch pipeline visits.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::message::Message;
use crate::scope::Scope;

/// What a user handler tells the dispatcher.
#[derive(Debug)]
pub enum Reply {
    /// Handled; answer a request with the unit reply (suppressed for
    /// plain asynchronous messages).
    Done,
    /// Handled; answer with this payload.
    Value(Message),
    /// Handled; answer with this error.
    Error(Error),
    /// Leave the envelope for a later behavior.
    Skip,
}

impl Reply {
    /// Shorthand for `Reply::Value(Message::new(v))`.
    pub fn with<T: Any + Send + Clone>(v: T) -> Reply {
        Reply::Value(Message::new(v))
    }
}

/// Internal dispatch outcome; `NoMatch` distinguishes "no case matched"
/// from an explicit skip.
#[derive(Debug)]
pub(crate) enum HandlerResult {
    Value(Message),
    Error(Error),
    NoMatch,
    Skip,
}

impl From<Reply> for HandlerResult {
    fn from(r: Reply) -> Self {
        match r {
            Reply::Done => HandlerResult::Value(Message::unit()),
            Reply::Value(m) => HandlerResult::Value(m),
            Reply::Error(e) => HandlerResult::Error(e),
            Reply::Skip => HandlerResult::Skip,
        }
    }
}

type Case = Box<dyn FnMut(&mut Scope<'_>, &mut Message) -> HandlerResult + Send>;
type TimeoutFn = Box<dyn FnMut(&mut Scope<'_>) + Send>;

struct BehaviorInner {
    cases: Vec<Mutex<Case>>,
    timeout: Option<Duration>,
    on_timeout: Option<Mutex<TimeoutFn>>,
}

/// A ref-counted handler set. Clones share the same cases, so the stack
/// can be reshuffled while one of its behaviors is mid-invocation.
#[derive(Clone)]
pub struct Behavior {
    inner: Arc<BehaviorInner>,
}

impl Behavior {
    /// Start building a behavior.
    pub fn new() -> BehaviorBuilder {
        BehaviorBuilder {
            cases: Vec::new(),
            timeout: None,
            on_timeout: None,
        }
    }

    /// A behavior with no cases. Pushing it is a no-op in `do_become`.
    pub fn empty() -> Behavior {
        Behavior {
            inner: Arc::new(BehaviorInner {
                cases: Vec::new(),
                timeout: None,
                on_timeout: None,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cases.is_empty()
    }

    /// The configured idle timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Identity comparison: two handles to the same handler set.
    pub fn same(&self, other: &Behavior) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Try every case in order against `msg`.
    pub(crate) fn invoke(&self, scope: &mut Scope<'_>, msg: &mut Message) -> HandlerResult {
        for case in &self.inner.cases {
            let mut f = case.lock().unwrap_or_else(|e| e.into_inner());
            match (*f)(scope, msg) {
                HandlerResult::NoMatch => continue,
                other => return other,
            }
        }
        HandlerResult::NoMatch
    }

    /// Run the idle-timeout callback, if one was installed.
    pub(crate) fn handle_timeout(&self, scope: &mut Scope<'_>) {
        if let Some(cb) = &self.inner.on_timeout {
            let mut f = cb.lock().unwrap_or_else(|e| e.into_inner());
            (*f)(scope);
        }
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("cases", &self.inner.cases.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Builder returned by [`Behavior::new`].
pub struct BehaviorBuilder {
    cases: Vec<Mutex<Case>>,
    timeout: Option<Duration>,
    on_timeout: Option<Mutex<TimeoutFn>>,
}

impl BehaviorBuilder {
    /// Add a case matching payloads of type `T`. The handler borrows the
    /// payload so a `Reply::Skip` leaves the envelope intact for recache.
    pub fn on<T, F>(mut self, mut f: F) -> Self
    where
        T: Any + Send + Clone,
        F: FnMut(&mut Scope<'_>, &mut T) -> Reply + Send + 'static,
    {
        self.cases.push(Mutex::new(Box::new(
            move |scope: &mut Scope<'_>, msg: &mut Message| match msg.get_mut::<T>() {
                Some(v) => f(scope, v).into(),
                None => HandlerResult::NoMatch,
            },
        )));
        self
    }

    /// Add a catch-all case that sees the raw [`Message`].
    pub fn on_any<F>(mut self, mut f: F) -> Self
    where
        F: FnMut(&mut Scope<'_>, &mut Message) -> Reply + Send + 'static,
    {
        self.cases.push(Mutex::new(Box::new(
            move |scope: &mut Scope<'_>, msg: &mut Message| f(scope, msg).into(),
        )));
        self
    }

    /// Install an idle timeout: if no ordinary message arrives within `d`,
    /// the callback runs (once per arming).
    pub fn with_idle_timeout<F>(mut self, d: Duration, f: F) -> Self
    where
        F: FnMut(&mut Scope<'_>) + Send + 'static,
    {
        self.timeout = Some(d);
        self.on_timeout = Some(Mutex::new(Box::new(f)));
        self
    }

    pub fn build(self) -> Behavior {
        Behavior {
            inner: Arc::new(BehaviorInner {
                cases: self.cases,
                timeout: self.timeout,
                on_timeout: self.on_timeout,
            }),
        }
    }
}
