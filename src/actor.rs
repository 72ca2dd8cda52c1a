//! The actor control block.
//!
//! An [`ActorCell`] owns everything an actor is: identity, lifecycle
//! flags, the mailbox, and the single-consumer execution state (behavior
//! stack, pending responses, flow-control ledger). Strong references
//! (`ActorRef`) keep the body alive; [`ActorAddr`] is an address-only weak
//! reference that survives the actor's death.
//!
//! Exactly one thread executes an actor at a time: a worker inside
//! `resume`, a private thread, or the blocking driver. All of that state
//! lives behind the `exec` lock, which is only ever taken by the thread
//! holding the scheduling token, so it is never contended.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::behavior::{Behavior, Reply};
use crate::config::DefaultHandlerFn;
use crate::detached::PrivateThread;
use crate::dispatch;
use crate::envelope::{Envelope, MessageId};
use crate::error::{Error, ExitReason};
use crate::mailbox::{Cache, EnqueueResult, Mailbox};
use crate::message::{DownMsg, ExitMsg, Message};
use crate::monitor::AttachState;
use crate::scheduler::ResumeResult;
use crate::scope::Scope;
use crate::system::SystemCore;

/// Stable numeric actor identity.
pub type ActorId = u64;

/// Strong, liveness-keeping reference to an actor.
pub type ActorRef = Arc<ActorCell>;

// ── Lifecycle flags ─────────────────────────────────────────────────────

const FLAG_INITIALIZED: u32 = 1 << 0;
const FLAG_TERMINATED: u32 = 1 << 1;
const FLAG_CLEANED_UP: u32 = 1 << 2;
const FLAG_DETACHED: u32 = 1 << 3;
const FLAG_BLOCKING: u32 = 1 << 4;
const FLAG_PRIORITY_AWARE: u32 = 1 << 5;
const FLAG_REGISTERED: u32 = 1 << 6;

// ── Address ─────────────────────────────────────────────────────────────

/// Address-only reference: identifies an actor without keeping its body
/// alive. Compares and hashes by id, so it remains a usable key after the
/// actor died.
#[derive(Clone)]
pub struct ActorAddr {
    id: ActorId,
    cell: Weak<ActorCell>,
}

impl ActorAddr {
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Reacquire a strong reference, if the actor is still alive.
    pub fn upgrade(&self) -> Option<ActorRef> {
        self.cell.upgrade()
    }

    /// An address that never upgrades. Test scaffolding.
    #[cfg(test)]
    pub(crate) fn dangling(id: ActorId) -> ActorAddr {
        ActorAddr {
            id,
            cell: Weak::new(),
        }
    }
}

impl PartialEq for ActorAddr {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActorAddr {}

impl std::hash::Hash for ActorAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ActorAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActorAddr({})", self.id)
    }
}

// ── Execution state ─────────────────────────────────────────────────────

/// One registered upstream stream generator at a source actor.
pub(crate) struct StreamSource {
    /// Produces and sends one flow-controlled payload; `false` when the
    /// stream ran dry.
    pub(crate) produce: Box<dyn FnMut() -> bool + Send>,
    /// Keeps the source alive while it has an open stream.
    pub(crate) keepalive: ActorRef,
}

pub(crate) type InitFn = Box<dyn FnOnce(&mut Scope<'_>) -> Behavior + Send>;
pub(crate) type DefaultOverride = Box<dyn FnMut(&mut Scope<'_>, &mut Message) -> Reply + Send>;
pub(crate) type ErrorHandler = Box<dyn FnMut(&mut Scope<'_>, Error) + Send>;
pub(crate) type DownHandler = Box<dyn FnMut(&mut Scope<'_>, DownMsg) + Send>;
pub(crate) type ExitHandler = Box<dyn FnMut(&mut Scope<'_>, ExitMsg) + Send>;
pub(crate) type ExceptionHandler =
    Box<dyn FnMut(&mut Scope<'_>, &(dyn std::any::Any + Send)) -> Option<ExitReason> + Send>;

/// Single-consumer half of the control block. Only the thread currently
/// executing the actor touches this.
pub(crate) struct ExecState {
    pub(crate) cache: Cache,
    pub(crate) bhvr_stack: Vec<Behavior>,
    /// Pending blocking-style responses; front is the most recent receive
    /// point.
    pub(crate) awaited: VecDeque<(MessageId, Behavior)>,
    /// Pending asynchronous responses keyed by response id.
    pub(crate) multiplexed: HashMap<MessageId, Behavior>,
    pub(crate) last_request_id: u64,
    pub(crate) timeout_id: u32,
    pub(crate) has_timeout: bool,
    /// The envelope whose handler is currently running.
    pub(crate) current: Option<Box<Envelope>>,
    pub(crate) fail_state: ExitReason,
    // Flow control ledger.
    pub(crate) open_credit: u64,
    pub(crate) low_watermark: u64,
    pub(crate) max_credit: u64,
    pub(crate) sources: HashMap<ActorAddr, u64>,
    pub(crate) generators: HashMap<ActorId, StreamSource>,
    pub(crate) subscriptions: Vec<Arc<dyn crate::group::Group>>,
    // Handler slots. `None` selects the built-in default; handlers are
    // taken out for the duration of a call so they may reinstall
    // themselves or a replacement.
    pub(crate) default_handler_fn: DefaultHandlerFn,
    pub(crate) default_override: Option<DefaultOverride>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) down_handler: Option<DownHandler>,
    pub(crate) exit_handler: Option<ExitHandler>,
    pub(crate) exception_handler: Option<ExceptionHandler>,
    pub(crate) init: Option<InitFn>,
}

impl ExecState {
    fn new(system: &SystemCore, init: Option<InitFn>) -> Self {
        let cfg = system.config();
        ExecState {
            cache: Cache::new(),
            bhvr_stack: Vec::new(),
            awaited: VecDeque::new(),
            multiplexed: HashMap::new(),
            last_request_id: 0,
            timeout_id: 0,
            has_timeout: false,
            current: None,
            fail_state: ExitReason::Normal,
            open_credit: cfg.max_credit,
            low_watermark: cfg.low_watermark,
            max_credit: cfg.max_credit,
            sources: HashMap::new(),
            generators: HashMap::new(),
            subscriptions: Vec::new(),
            default_handler_fn: cfg.default_handler,
            default_override: None,
            error_handler: None,
            down_handler: None,
            exit_handler: None,
            exception_handler: None,
            init,
        }
    }

    /// A fresh monotonically increasing request id.
    pub(crate) fn new_request_id(&mut self, high_priority: bool) -> MessageId {
        self.last_request_id += 1;
        let mid = MessageId::from_request_id(self.last_request_id);
        if high_priority {
            mid.with_high_priority()
        } else {
            mid
        }
    }

    pub(crate) fn has_behavior(&self) -> bool {
        !self.bhvr_stack.is_empty() || !self.awaited.is_empty() || !self.multiplexed.is_empty()
    }

    pub(crate) fn awaits_response(&self) -> bool {
        !self.awaited.is_empty()
    }

    pub(crate) fn awaited_response_id(&self) -> MessageId {
        self.awaited
            .front()
            .map_or_else(MessageId::make, |(mid, _)| *mid)
    }

    /// Flow-controlled messages currently assumed to be in flight.
    pub(crate) fn in_flight(&self) -> u64 {
        self.max_credit - self.open_credit
    }
}

/// Condvar slot a blocking actor sleeps on in `await_data`.
pub(crate) struct SleepSlot {
    pub(crate) lock: Mutex<()>,
    pub(crate) cv: Condvar,
}

// ── Control block ───────────────────────────────────────────────────────

/// The actor control block. See module docs for the threading contract.
pub struct ActorCell {
    id: ActorId,
    name: String,
    flags: AtomicU32,
    /// Back-reference for minting strong handles from `&self`; installed
    /// by `Arc::new_cyclic` at spawn.
    weak_self: Weak<ActorCell>,
    pub(crate) mailbox: Mailbox,
    pub(crate) exec: Mutex<ExecState>,
    pub(crate) attach: Mutex<AttachState>,
    pub(crate) sleep: SleepSlot,
    pub(crate) private_thread: Mutex<Option<Arc<PrivateThread>>>,
    pub(crate) system: Arc<SystemCore>,
}

impl ActorCell {
    pub(crate) fn new(
        system: Arc<SystemCore>,
        id: ActorId,
        name: String,
        init: Option<InitFn>,
        weak_self: Weak<ActorCell>,
    ) -> ActorCell {
        let exec = ExecState::new(&system, init);
        ActorCell {
            id,
            name,
            flags: AtomicU32::new(0),
            weak_self,
            mailbox: Mailbox::new(),
            exec: Mutex::new(exec),
            attach: Mutex::new(AttachState::new()),
            sleep: SleepSlot {
                lock: Mutex::new(()),
                cv: Condvar::new(),
            },
            private_thread: Mutex::new(None),
            system,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address-only reference to this actor.
    pub fn addr(&self) -> ActorAddr {
        ActorAddr {
            id: self.id,
            cell: self.weak_self.clone(),
        }
    }

    /// A fresh strong handle. `None` only while the last strong reference
    /// is already gone.
    pub(crate) fn strong(&self) -> Option<ActorRef> {
        self.weak_self.upgrade()
    }

    // ── Flags ───────────────────────────────────────────────────────────

    fn flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    fn set_flag(&self, bit: u32, value: bool) {
        if value {
            self.flags.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.flag(FLAG_INITIALIZED)
    }

    pub fn is_terminated(&self) -> bool {
        self.flag(FLAG_TERMINATED)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.flag(FLAG_CLEANED_UP)
    }

    pub fn is_detached(&self) -> bool {
        self.flag(FLAG_DETACHED)
    }

    pub fn is_blocking(&self) -> bool {
        self.flag(FLAG_BLOCKING)
    }

    pub fn is_priority_aware(&self) -> bool {
        self.flag(FLAG_PRIORITY_AWARE)
    }

    pub fn is_registered(&self) -> bool {
        self.flag(FLAG_REGISTERED)
    }

    pub(crate) fn mark_initialized(&self) {
        self.set_flag(FLAG_INITIALIZED, true);
    }

    pub(crate) fn mark_terminated(&self) {
        self.set_flag(FLAG_TERMINATED, true);
    }

    pub(crate) fn mark_cleaned_up(&self) {
        self.set_flag(FLAG_CLEANED_UP, true);
    }

    pub(crate) fn set_detached(&self, v: bool) {
        self.set_flag(FLAG_DETACHED, v);
    }

    pub(crate) fn set_blocking(&self, v: bool) {
        self.set_flag(FLAG_BLOCKING, v);
    }

    pub(crate) fn set_priority_aware(&self, v: bool) {
        self.set_flag(FLAG_PRIORITY_AWARE, v);
    }

    pub(crate) fn set_registered(&self, v: bool) {
        self.set_flag(FLAG_REGISTERED, v);
    }

    // ── Enqueue & launch ────────────────────────────────────────────────

    /// Deposit an envelope. On the empty-and-blocked → nonempty transition
    /// the caller side reschedules the actor: blocking actors are woken on
    /// their condvar, detached actors through their private thread, and
    /// pooled actors via `exec_later`. Requests hitting a closed mailbox
    /// bounce a [`Error::QueueClosed`] response.
    pub fn enqueue(&self, env: Box<Envelope>) {
        let mid = env.mid;
        let sender = env.sender.clone();
        self.system.pool().note_message_sent();
        match self.mailbox.enqueue(env) {
            EnqueueResult::UnblockedReader => {
                if self.is_blocking() {
                    let _guard = self.sleep.lock.lock().unwrap_or_else(|e| e.into_inner());
                    self.sleep.cv.notify_one();
                } else if self.is_detached() {
                    let pt = {
                        let slot = self
                            .private_thread
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        slot.clone()
                    };
                    if let Some(pt) = pt {
                        pt.resume();
                    }
                } else if let Some(me) = self.strong() {
                    self.system.pool().exec_later(me);
                }
            }
            EnqueueResult::QueueClosed => {
                if mid.is_request() {
                    bounce_request(sender, mid);
                }
            }
            EnqueueResult::Success => {}
        }
    }

    /// First scheduling decision after spawn. Detached actors get their
    /// own thread elsewhere; pooled actors either block lazily or take
    /// their initial trip through the pool.
    pub(crate) fn launch(&self, lazy: bool) {
        debug_assert!(!self.is_detached());
        if lazy && self.mailbox.try_block() {
            return;
        }
        if let Some(me) = self.strong() {
            self.system.pool().exec_later(me);
        }
    }

    // ── Resumable driver ────────────────────────────────────────────────

    /// Cooperative step: process up to `max_throughput` envelopes. Never
    /// lets user panics escape to the worker.
    pub fn resume(&self, max_throughput: usize) -> ResumeResult {
        debug_assert!(!self.is_blocking());
        let Some(me) = self.strong() else {
            return ResumeResult::Done;
        };
        let mut guard = self.exec.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_initialized() && (!guard.has_behavior() || self.is_terminated()) {
            tracing::debug!(id = self.id, "resume on a finished actor");
            return ResumeResult::Done;
        }
        let outcome = {
            let exec = &mut *guard;
            catch_unwind(AssertUnwindSafe(|| resume_inner(&me, exec, max_throughput)))
        };
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                tracing::debug!(id = self.id, "actor died of an escaped panic");
                let exec = &mut *guard;
                let reason = dispatch::map_exception(&me, exec, payload.as_ref());
                if !self.is_terminated() {
                    exec.fail_state = reason;
                    self.mark_terminated();
                }
                if !dispatch::finished(&me, exec) {
                    // The exception handler revived the actor.
                    return ResumeResult::ResumeLater;
                }
                ResumeResult::Done
            }
        }
    }

    /// One-envelope variant of [`resume`](ActorCell::resume), for
    /// transports driving the actor synchronously.
    pub fn exec_single_event(&self, env: Box<Envelope>) {
        let Some(me) = self.strong() else {
            return;
        };
        let mut guard = self.exec.lock().unwrap_or_else(|e| e.into_inner());
        {
            let exec = &mut *guard;
            if !self.is_initialized() {
                self.mark_initialized();
                let init = exec.init.take();
                if let Some(f) = init {
                    let bhvr = f(&mut Scope::new(&me, exec));
                    if !bhvr.is_empty() {
                        dispatch::do_become(&me, exec, bhvr, false);
                    }
                }
                if dispatch::finished(&me, exec) {
                    return;
                }
            }
            if !exec.has_behavior() || self.is_terminated() {
                return;
            }
        }
        let outcome = {
            let exec = &mut *guard;
            catch_unwind(AssertUnwindSafe(|| {
                dispatch::exec_event(&me, exec, env);
            }))
        };
        if let Err(payload) = outcome {
            let exec = &mut *guard;
            let reason = dispatch::map_exception(&me, exec, payload.as_ref());
            if !self.is_terminated() {
                exec.fail_state = reason;
                self.mark_terminated();
            }
            dispatch::finished(&me, exec);
        }
    }
}

impl std::fmt::Debug for ActorCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Body of one resume step; runs under the exec lock, inside the panic
/// barrier.
fn resume_inner(cell: &ActorRef, exec: &mut ExecState, max_throughput: usize) -> ResumeResult {
    if !cell.is_initialized() {
        cell.mark_initialized();
        let init = exec.init.take();
        if let Some(f) = init {
            let bhvr = f(&mut Scope::new(cell, exec));
            if !bhvr.is_empty() {
                dispatch::do_become(cell, exec, bhvr, false);
            }
        }
        if dispatch::finished(cell, exec) {
            tracing::debug!(id = cell.id(), "actor finished right after initialize");
            return ResumeResult::Done;
        }
    }
    let mut handled: usize = 0;
    for _ in 0..max_throughput {
        match cell
            .mailbox
            .next_message(&mut exec.cache, cell.is_priority_aware())
        {
            Some(env) => {
                cell.system.pool().note_message_received();
                let (done, success) = dispatch::exec_event(cell, exec, env);
                if done {
                    return ResumeResult::Done;
                }
                if success {
                    handled += 1;
                }
            }
            None => {
                rearm_timeout(cell, exec, handled);
                handled = 0;
                if cell.mailbox.try_block() {
                    return ResumeResult::AwaitingMessage;
                }
                // A message raced in between the empty observation and the
                // block attempt; keep draining.
            }
        }
    }
    rearm_timeout(cell, exec, handled);
    if !cell.mailbox.has_next_message(&exec.cache) && cell.mailbox.try_block() {
        return ResumeResult::AwaitingMessage;
    }
    ResumeResult::ResumeLater
}

/// Re-arm the top behavior's idle timeout after a batch that handled at
/// least one message.
fn rearm_timeout(cell: &ActorRef, exec: &mut ExecState, handled: usize) {
    if handled > 0 {
        if let Some(top) = exec.bhvr_stack.last().cloned() {
            dispatch::request_timeout(cell, exec, top.timeout());
        }
    }
}

/// Answer a request whose receiver is gone with a failure response.
pub(crate) fn bounce_request(sender: Option<ActorRef>, mid: MessageId) {
    if let Some(s) = sender {
        s.enqueue(Envelope::make(
            None,
            mid.response_id(),
            Message::new(Error::QueueClosed),
        ));
    }
}

/// Fire-and-forget send without a sender, for code running outside any
/// actor context.
pub fn anon_send<T: std::any::Any + Send + Clone>(dest: &ActorRef, payload: T) {
    dest.enqueue(Envelope::make(None, MessageId::make(), Message::new(payload)));
}
