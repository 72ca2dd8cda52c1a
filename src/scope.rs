//! The actor's view of itself while a handler runs.
//!
//! A [`Scope`] borrows the control block and its execution state for the
//! duration of one dispatch. Every self-operation — sending, requesting,
//! changing behavior, linking, joining groups, opening streams — goes
//! through here; there is no ambient "current actor" global.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::actor::{ActorAddr, ActorId, ActorRef, ExecState};
use crate::behavior::{Behavior, Reply};
use crate::dispatch;
use crate::envelope::{Envelope, MessageId};
use crate::error::{Error, ExitReason};
use crate::flow::{self, StreamHandle};
use crate::group::Group;
use crate::link;
use crate::message::{DownMsg, ExitMsg, Message};
use crate::monitor::{self, ObserveKind};
use crate::system::{ActorSystem, SpawnOptions};

/// Exclusive handle on the running actor, passed to every handler.
pub struct Scope<'a> {
    pub(crate) cell: &'a ActorRef,
    pub(crate) exec: &'a mut ExecState,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(cell: &'a ActorRef, exec: &'a mut ExecState) -> Scope<'a> {
        Scope { cell, exec }
    }

    // ── Identity ────────────────────────────────────────────────────────

    pub fn id(&self) -> ActorId {
        self.cell.id()
    }

    pub fn name(&self) -> &str {
        self.cell.name()
    }

    pub fn addr(&self) -> ActorAddr {
        self.cell.addr()
    }

    /// A strong reference to this actor.
    pub fn self_ref(&self) -> ActorRef {
        Arc::clone(self.cell)
    }

    pub fn system(&self) -> ActorSystem {
        ActorSystem::from_core(Arc::clone(&self.cell.system))
    }

    /// Sender of the message currently being handled.
    pub fn sender(&self) -> Option<ActorRef> {
        self.exec.current.as_ref().and_then(|e| e.sender.clone())
    }

    /// Id of the message currently being handled.
    pub fn current_message_id(&self) -> MessageId {
        self.exec
            .current
            .as_ref()
            .map_or_else(MessageId::make, |e| e.mid)
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Fire-and-forget send.
    pub fn send<T: Any + Send + Clone>(&mut self, dest: &ActorRef, payload: T) {
        dest.enqueue(Envelope::make(
            Some(self.self_ref()),
            MessageId::make(),
            Message::new(payload),
        ));
    }

    /// Fire-and-forget send that overtakes low-priority envelopes at the
    /// receiver, if the receiver is priority-aware.
    pub fn send_high_priority<T: Any + Send + Clone>(&mut self, dest: &ActorRef, payload: T) {
        dest.enqueue(Envelope::make(
            Some(self.self_ref()),
            MessageId::make().with_high_priority(),
            Message::new(payload),
        ));
    }

    /// Send a request and register `on_response` as the multiplexed
    /// response handler for its id. If the behavior carries an idle
    /// timeout, a [`Error::RequestTimeout`] response is scheduled for it.
    pub fn request<T: Any + Send + Clone>(
        &mut self,
        dest: &ActorRef,
        payload: T,
        on_response: Behavior,
    ) -> MessageId {
        let mid = self.exec.new_request_id(false);
        dest.enqueue(Envelope::make(
            Some(self.self_ref()),
            mid,
            Message::new(payload),
        ));
        self.register_multiplexed(mid.response_id(), on_response);
        mid
    }

    pub(crate) fn register_multiplexed(&mut self, response_id: MessageId, bhvr: Behavior) {
        debug_assert!(response_id.is_response());
        if let Some(d) = bhvr.timeout() {
            self.cell.system.clock().delayed_send(
                d,
                Some(self.self_ref()),
                self.addr(),
                response_id,
                Message::new(Error::RequestTimeout),
            );
        }
        self.exec.multiplexed.insert(response_id, bhvr);
    }

    /// Forward the current envelope to `dest` with a fresh payload,
    /// keeping its request id so `dest`'s reply reaches the original
    /// requester. This actor is recorded as a forwarding stage.
    pub fn delegate<T: Any + Send + Clone>(&mut self, dest: &ActorRef, payload: T) {
        let Some(mut env) = self.exec.current.take() else {
            tracing::warn!(id = self.id(), "delegate without a current message");
            return;
        };
        env.payload = Message::new(payload);
        env.stages.push(self.self_ref());
        dest.enqueue(env);
    }

    /// Create a promise to answer the current request later. Marks the
    /// request answered so no automatic reply is produced.
    pub fn make_response_promise(&mut self) -> ResponsePromise {
        let Some(current) = self.exec.current.as_mut() else {
            return ResponsePromise::invalid();
        };
        if current.mid.is_answered() || !current.mid.is_request() {
            return ResponsePromise::invalid();
        }
        let promise = ResponsePromise {
            dest: current.sender.clone(),
            mid: current.mid,
        };
        current.mid.mark_answered();
        promise
    }

    /// Send an exit message to `dest`.
    pub fn send_exit(&mut self, dest: &ActorRef, reason: ExitReason) {
        link::send_exit(&self.addr(), dest, reason);
    }

    // ── Behavior & lifecycle ────────────────────────────────────────────

    /// Replace or stack the current behavior. Installing a behavior also
    /// arms its idle timeout, invalidating all previously issued timeout
    /// ids.
    pub fn do_become(&mut self, bhvr: Behavior, discard_old: bool) {
        dispatch::do_become(self.cell, self.exec, bhvr, discard_old);
    }

    /// Pop the top behavior.
    pub fn unbecome(&mut self) {
        self.exec.bhvr_stack.pop();
    }

    /// Finish execution after the current handler returns. Event-based
    /// actors terminate at the next dispatch boundary; blocking actors
    /// unwind immediately.
    pub fn quit(&mut self, reason: ExitReason) {
        tracing::debug!(id = self.id(), %reason, "quit");
        self.exec.fail_state = reason;
        self.cell.mark_terminated();
        if self.cell.is_blocking() {
            crate::blocking::unwind_blocking();
        }
    }

    // ── Monitors & links ────────────────────────────────────────────────

    /// Attach a one-shot observer to `peer`: when it terminates, this
    /// actor receives a [`DownMsg`] with `peer`'s address and exit reason.
    /// Each call creates an independent monitor.
    pub fn monitor(&mut self, peer: &ActorRef) {
        monitor::attach_observer(peer, self.addr(), ObserveKind::Monitor);
    }

    /// Remove one monitor previously attached to `peer`.
    pub fn demonitor(&mut self, peer: &ActorAddr) {
        if let Some(peer) = peer.upgrade() {
            monitor::detach_observer(&peer, &self.addr(), ObserveKind::Monitor);
        }
    }

    /// Establish a bidirectional link with `peer`.
    pub fn link_to(&mut self, peer: &ActorRef) {
        link::link(self.cell, peer);
    }

    /// Dissolve a bidirectional link with `peer`.
    pub fn unlink_from(&mut self, peer: &ActorAddr) {
        link::unlink(self.cell, peer);
    }

    // ── Groups ──────────────────────────────────────────────────────────

    /// Subscribe to `group`; automatically unsubscribed on cleanup.
    pub fn join(&mut self, group: Arc<dyn Group>) {
        if self
            .exec
            .subscriptions
            .iter()
            .any(|g| Arc::ptr_eq(g, &group))
        {
            return;
        }
        if group.subscribe(self.self_ref()) {
            self.exec.subscriptions.push(group);
        }
    }

    /// Leave `group`.
    pub fn leave(&mut self, group: &Arc<dyn Group>) {
        let before = self.exec.subscriptions.len();
        self.exec.subscriptions.retain(|g| !Arc::ptr_eq(g, group));
        if self.exec.subscriptions.len() != before {
            group.unsubscribe(&self.addr());
        }
    }

    pub fn joined_groups(&self) -> Vec<Arc<dyn Group>> {
        self.exec.subscriptions.clone()
    }

    // ── Streams ─────────────────────────────────────────────────────────

    /// Register a generator producing flow-controlled payloads for `sink`.
    /// Idempotent per sink. The sink is sent the add-source handshake.
    pub fn new_stream<F>(&mut self, sink: &ActorRef, generator: F) -> StreamHandle
    where
        F: FnMut() -> Option<Message> + Send + 'static,
    {
        flow::new_stream(self.cell, self.exec, sink, Box::new(generator))
    }

    // ── Handlers ────────────────────────────────────────────────────────

    /// Override the default handler for unmatched ordinary messages.
    pub fn set_default_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut Scope<'_>, &mut Message) -> Reply + Send + 'static,
    {
        self.exec.default_override = Some(Box::new(f));
    }

    pub fn set_error_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut Scope<'_>, Error) + Send + 'static,
    {
        self.exec.error_handler = Some(Box::new(f));
    }

    pub fn set_down_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut Scope<'_>, DownMsg) + Send + 'static,
    {
        self.exec.down_handler = Some(Box::new(f));
    }

    pub fn set_exit_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut Scope<'_>, ExitMsg) + Send + 'static,
    {
        self.exec.exit_handler = Some(Box::new(f));
    }

    /// Translate escaped panics into an exit reason. Returning `None`
    /// keeps the default [`ExitReason::UnhandledException`].
    pub fn set_exception_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut Scope<'_>, &(dyn Any + Send)) -> Option<ExitReason> + Send + 'static,
    {
        self.exec.exception_handler = Some(Box::new(f));
    }

    // ── Spawning ────────────────────────────────────────────────────────

    /// Spawn a child with default options.
    pub fn spawn<F>(&mut self, init: F) -> ActorRef
    where
        F: FnOnce(&mut Scope<'_>) -> Behavior + Send + 'static,
    {
        self.spawn_opts(SpawnOptions::default(), init)
    }

    /// Spawn a child, applying link/monitor options relative to this
    /// actor.
    pub fn spawn_opts<F>(&mut self, opts: SpawnOptions, init: F) -> ActorRef
    where
        F: FnOnce(&mut Scope<'_>) -> Behavior + Send + 'static,
    {
        let link_flag = opts.link;
        let monitor_flag = opts.monitor;
        let child = self.system().spawn_opts(opts, init);
        if monitor_flag {
            self.monitor(&child);
        }
        if link_flag {
            self.link_to(&child);
        }
        child
    }

    // ── Timeouts ────────────────────────────────────────────────────────

    /// Arm (or clear, with `None`) the idle timeout. Returns the new
    /// timeout generation, `0` when cleared.
    pub fn request_timeout(&mut self, d: Option<Duration>) -> u32 {
        dispatch::request_timeout(self.cell, self.exec, d)
    }
}

// ── Response promise ────────────────────────────────────────────────────

/// A promise to answer a request later. Delivery rules match the dispatch
/// pipeline: responses to requests carry the response id; replies to plain
/// asynchronous messages fall back to ordinary sends, with empty replies
/// suppressed.
pub struct ResponsePromise {
    dest: Option<ActorRef>,
    mid: MessageId,
}

impl ResponsePromise {
    fn invalid() -> ResponsePromise {
        ResponsePromise {
            dest: None,
            mid: MessageId::make(),
        }
    }

    pub(crate) fn new(dest: Option<ActorRef>, mid: MessageId) -> ResponsePromise {
        ResponsePromise { dest, mid }
    }

    /// `true` if delivering will actually produce a message.
    pub fn pending(&self) -> bool {
        self.dest.is_some() && !self.mid.is_answered()
    }

    /// Deliver a payload.
    pub fn deliver(self, msg: Message) {
        let Some(dest) = self.dest else {
            tracing::debug!("suppress response message: invalid response promise");
            return;
        };
        if self.mid.is_request() {
            dest.enqueue(Envelope::make(None, self.mid.response_id(), msg));
        } else if !msg.is_unit() {
            // Replying to a plain asynchronous message: ordinary send.
            dest.enqueue(Envelope::make(None, MessageId::make(), msg));
        }
    }

    /// Deliver an error.
    pub fn deliver_error(self, e: Error) {
        let Some(dest) = self.dest else {
            tracing::debug!("suppress error response: invalid response promise");
            return;
        };
        if self.mid.is_request() {
            dest.enqueue(Envelope::make(
                None,
                self.mid.response_id(),
                Message::new(e),
            ));
        } else {
            tracing::debug!(error = %e, "dropped error reply to asynchronous message");
        }
    }
}

impl std::fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("mid", &self.mid)
            .field("pending", &self.pending())
            .finish()
    }
}
