//! The message dispatch pipeline.
//!
//! Every dequeued envelope is classified first; system payloads apply
//! their side effects during classification and never reach user
//! behaviors. Ordinary messages run against the top of the behavior stack
//! (or the current awaited-response handler), responses are routed through
//! the pending-response tables, and timeouts are matched against the
//! active generation.
//!
//! Classification is an exhaustive match over the reserved payload types
//! with `Ordinary` as the final arm; there is no fallthrough an envelope
//! could silently drop into.

use std::sync::Arc;
use std::time::Duration;

use crate::actor::{self, ActorRef, ExecState};
use crate::behavior::{Behavior, HandlerResult};
use crate::envelope::{Envelope, MessageId};
use crate::error::{Error, ExitReason};
use crate::flow;
use crate::message::{
    ActorInfo, AddSource, CreditGrant, DelSource, DownMsg, ExitMsg, Message, SysRequest,
    TimeoutMsg,
};
use crate::monitor;
use crate::scope::{ResponsePromise, Scope};

/// Classification of a dequeued envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgType {
    /// A timeout whose generation is no longer active.
    ExpiredTimeout,
    /// The currently armed timeout.
    ActiveTimeout,
    /// An asynchronous message or request for the behavior stack.
    Ordinary,
    /// An answer to a pending request.
    Response,
    /// A system message; side effects applied during classification.
    SysMessage,
}

/// Dispatch outcome for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvokeResult {
    Success,
    Skipped,
    Dropped,
}

// ── Behavior stack ──────────────────────────────────────────────────────

/// Install `bhvr`: optionally pop the old top first, arm the new idle
/// timeout (invalidating all prior timeout ids), push.
pub(crate) fn do_become(cell: &ActorRef, exec: &mut ExecState, bhvr: Behavior, discard_old: bool) {
    if discard_old {
        exec.bhvr_stack.pop();
    }
    request_timeout(cell, exec, bhvr.timeout());
    exec.bhvr_stack.push(bhvr);
}

// ── Timeouts ────────────────────────────────────────────────────────────

/// Arm a new timeout generation, or clear the active one when `d` is
/// `None`. A zero duration enqueues the timeout immediately. Returns the
/// id carried by the emitted timeout envelope (`0` when cleared).
pub(crate) fn request_timeout(
    cell: &ActorRef,
    exec: &mut ExecState,
    d: Option<Duration>,
) -> u32 {
    let Some(d) = d else {
        exec.has_timeout = false;
        return 0;
    };
    exec.has_timeout = true;
    exec.timeout_id = exec.timeout_id.wrapping_add(1);
    let id = exec.timeout_id;
    tracing::trace!(id = cell.id(), timeout_id = id, "arm idle timeout");
    let msg = Message::new(TimeoutMsg { id });
    if d.is_zero() {
        cell.enqueue(Envelope::make(None, MessageId::make(), msg));
    } else {
        cell.system
            .clock()
            .delayed_send(d, None, cell.addr(), MessageId::make(), msg);
    }
    id
}

fn is_active_timeout(exec: &ExecState, tid: u32) -> bool {
    exec.has_timeout && exec.timeout_id == tid
}

/// Run the idle callback of `bhvr` for an active timeout. If the callback
/// did not change the behavior and the actor is blocking-style, the top
/// behavior is popped so the enclosing receive returns.
fn handle_timeout(cell: &ActorRef, exec: &mut ExecState, bhvr: &Behavior, tid: u32) {
    if !is_active_timeout(exec, tid) {
        return;
    }
    exec.has_timeout = false;
    bhvr.handle_timeout(&mut Scope::new(cell, exec));
    let top_unchanged = exec.bhvr_stack.last().is_some_and(|top| top.same(bhvr));
    if !top_unchanged {
        return;
    }
    if cell.is_blocking() {
        exec.bhvr_stack.pop();
    }
}

// ── Classification ──────────────────────────────────────────────────────

/// Classify one envelope, applying system-message side effects. Runs
/// before the envelope becomes the current element, so handlers invoked
/// from here observe no current sender.
fn classify(cell: &ActorRef, exec: &mut ExecState, env: &mut Envelope) -> MsgType {
    if env.mid.is_response() {
        return MsgType::Response;
    }
    if env.payload.is::<SysRequest>() {
        let key = env
            .payload
            .get::<SysRequest>()
            .map(|r| r.key.clone())
            .unwrap_or_default();
        if let Some(sender) = &env.sender {
            if key == "info" {
                tracing::debug!(id = cell.id(), "reply to 'info' message");
                sender.enqueue(Envelope::make(
                    Some(Arc::clone(cell)),
                    env.mid.response_id(),
                    Message::new(ActorInfo {
                        ctrl: cell.addr(),
                        name: cell.name().to_string(),
                    }),
                ));
            } else {
                sender.enqueue(Envelope::make(
                    Some(Arc::clone(cell)),
                    env.mid.response_id(),
                    Message::new(Error::UnsupportedSysKey),
                ));
            }
        }
        return MsgType::SysMessage;
    }
    if env.payload.is::<AddSource>() {
        flow::on_add_source(cell, exec, env);
        return MsgType::SysMessage;
    }
    if env.payload.is::<DelSource>() {
        if let Some(del) = env.payload.take::<DelSource>() {
            flow::on_del_source(cell, exec, &del.source);
        }
        return MsgType::SysMessage;
    }
    if env.payload.is::<CreditGrant>() {
        flow::on_credit_granted(cell, exec, env);
        return MsgType::SysMessage;
    }
    if let Some(tm) = env.payload.get::<TimeoutMsg>() {
        debug_assert!(env.mid.is_async());
        return if is_active_timeout(exec, tm.id) {
            MsgType::ActiveTimeout
        } else {
            MsgType::ExpiredTimeout
        };
    }
    if env.payload.is::<ExitMsg>() {
        if let Some(em) = env.payload.take::<ExitMsg>() {
            // Drop the attachable for the dead peer before anything else.
            crate::link::unlink(cell, &em.source);
            if em.reason == ExitReason::Kill {
                Scope::new(cell, exec).quit(ExitReason::Kill);
            } else {
                run_exit_handler(cell, exec, em);
            }
        }
        return MsgType::SysMessage;
    }
    if env.payload.is::<DownMsg>() {
        if let Some(dm) = env.payload.take::<DownMsg>() {
            run_down_handler(cell, exec, dm);
        }
        return MsgType::SysMessage;
    }
    if env.payload.is::<Error>() {
        if let Some(err) = env.payload.take::<Error>() {
            run_error_handler(cell, exec, err);
        }
        return MsgType::SysMessage;
    }
    MsgType::Ordinary
}

// ── Invocation ──────────────────────────────────────────────────────────

/// Dispatch one envelope against `bhvr`. `slot` keeps ownership of the
/// envelope: it is consumed on success/drop and handed back on skip so
/// the caller can cache it.
pub(crate) fn invoke_message(
    cell: &ActorRef,
    exec: &mut ExecState,
    slot: &mut Option<Box<Envelope>>,
    bhvr: &Behavior,
    awaited_id: MessageId,
) -> InvokeResult {
    let env = slot.as_mut().expect("invoke_message without an envelope");
    let awaiting = awaited_id != MessageId::make();
    match classify(cell, exec, env) {
        MsgType::ExpiredTimeout => {
            tracing::debug!(id = cell.id(), "dropped expired timeout message");
            slot.take();
            InvokeResult::Dropped
        }
        MsgType::SysMessage => {
            slot.take();
            InvokeResult::Dropped
        }
        MsgType::ActiveTimeout => {
            if awaiting {
                // Ignore asynchronous timeouts at a synchronous receive
                // point.
                slot.take();
                return InvokeResult::Dropped;
            }
            let tid = slot
                .take()
                .and_then(|e| e.payload.get::<TimeoutMsg>().map(|t| t.id))
                .unwrap_or_default();
            handle_timeout(cell, exec, bhvr, tid);
            InvokeResult::Success
        }
        MsgType::Response => invoke_response(cell, exec, slot, awaited_id),
        MsgType::Ordinary => invoke_ordinary(cell, exec, slot, bhvr, awaiting),
    }
}

fn invoke_response(
    cell: &ActorRef,
    exec: &mut ExecState,
    slot: &mut Option<Box<Envelope>>,
    awaited_id: MessageId,
) -> InvokeResult {
    let mid = slot.as_ref().map_or_else(MessageId::make, |e| e.mid);
    let awaiting = awaited_id != MessageId::make();
    if let Some(bhvr) = exec.multiplexed.get(&mid).cloned() {
        if !awaiting {
            exec.multiplexed.remove(&mid);
            handle_response(cell, exec, slot, &bhvr);
            return InvokeResult::Success;
        }
        tracing::debug!(id = cell.id(), ?mid, "skipped multiplexed response");
        return InvokeResult::Skipped;
    }
    if let Some(pos) = exec.awaited.iter().position(|(id, _)| *id == mid) {
        if awaiting && mid == awaited_id {
            let (_, bhvr) = exec.awaited.remove(pos).expect("position just found");
            handle_response(cell, exec, slot, &bhvr);
            return InvokeResult::Success;
        }
        return InvokeResult::Skipped;
    }
    tracing::debug!(id = cell.id(), ?mid, "dropped expired response");
    slot.take();
    InvokeResult::Dropped
}

/// Run a pending-response handler. A payload the handler does not match
/// is wrapped as [`Error::UnexpectedResponse`] and re-dispatched once; if
/// still unmatched, the error handler runs.
fn handle_response(
    cell: &ActorRef,
    exec: &mut ExecState,
    slot: &mut Option<Box<Envelope>>,
    bhvr: &Behavior,
) {
    let env = slot.take().expect("response envelope");
    exec.current = Some(env);
    let mut payload = current_payload(exec);
    let res = bhvr.invoke(&mut Scope::new(cell, exec), &mut payload);
    match res {
        HandlerResult::NoMatch => {
            if payload.is::<Error>() {
                let err = payload.take::<Error>().expect("checked Error payload");
                run_error_handler(cell, exec, err);
            } else {
                let err = Error::UnexpectedResponse(Box::new(payload.take_message()));
                let mut err_msg = Message::new(err.clone());
                match bhvr.invoke(&mut Scope::new(cell, exec), &mut err_msg) {
                    HandlerResult::NoMatch => {
                        tracing::warn!(id = cell.id(), "multiplexed response failure");
                        run_error_handler(cell, exec, err);
                    }
                    other => deliver_result(cell, exec, other),
                }
            }
        }
        other => deliver_result(cell, exec, other),
    }
    exec.current = None;
}

fn invoke_ordinary(
    cell: &ActorRef,
    exec: &mut ExecState,
    slot: &mut Option<Box<Envelope>>,
    bhvr: &Behavior,
    awaiting: bool,
) -> InvokeResult {
    if awaiting {
        tracing::debug!(id = cell.id(), "skipped asynchronous message while awaiting");
        return InvokeResult::Skipped;
    }
    let had_timeout = exec.has_timeout;
    if had_timeout {
        exec.has_timeout = false;
    }
    let env = slot.take().expect("ordinary envelope");
    let flow_controlled = env.mid.is_flow_controlled();
    let source = env.sender.as_ref().map(|s| s.addr());
    exec.current = Some(env);
    let mut payload = current_payload(exec);
    let mut skipped = false;

    if !flow_controlled {
        let res = bhvr.invoke(&mut Scope::new(cell, exec), &mut payload);
        match res {
            HandlerResult::Skip => skipped = true,
            HandlerResult::NoMatch => {
                if had_timeout {
                    exec.has_timeout = true;
                }
                match run_default_handler(cell, exec, &mut payload) {
                    HandlerResult::Skip => skipped = true,
                    other => deliver_result(cell, exec, other),
                }
            }
            other => deliver_result(cell, exec, other),
        }
    } else {
        match source {
            None => {
                tracing::error!(id = cell.id(), "flow-controlled message from anonymous sender");
            }
            Some(src) if !exec.sources.contains_key(&src) => {
                tracing::error!(
                    id = cell.id(),
                    source = src.id(),
                    "flow-controlled message from unknown source"
                );
            }
            Some(src) => {
                let res = bhvr.invoke(&mut Scope::new(cell, exec), &mut payload);
                match res {
                    HandlerResult::Skip => skipped = true,
                    HandlerResult::NoMatch => {
                        if had_timeout {
                            exec.has_timeout = true;
                        }
                        match run_default_handler(cell, exec, &mut payload) {
                            HandlerResult::Skip => skipped = true,
                            other => visit_flow_result(cell, exec, other, &src),
                        }
                    }
                    other => visit_flow_result(cell, exec, other, &src),
                }
            }
        }
    }

    // Take the envelope back out of the current slot; a delegate call may
    // already have forwarded it.
    let env = exec.current.take();
    if skipped {
        if had_timeout {
            exec.has_timeout = true;
        }
        if let Some(mut env) = env {
            env.payload = payload;
            *slot = Some(env);
        }
        return InvokeResult::Skipped;
    }
    InvokeResult::Success
}

/// Matched flow-controlled messages that produced an empty reply return
/// one credit to the resolved source; anything else is a protocol misuse.
fn visit_flow_result(
    cell: &ActorRef,
    exec: &mut ExecState,
    res: HandlerResult,
    src: &crate::actor::ActorAddr,
) {
    match res {
        HandlerResult::Value(m) if m.is_unit() => {
            flow::grant_credit(cell, exec, 1, Some(src.clone()));
        }
        HandlerResult::Value(_) => {
            tracing::warn!(id = cell.id(), "flow-controlled handler returned a message");
        }
        HandlerResult::Error(e) => {
            tracing::warn!(id = cell.id(), error = %e, "flow-controlled handler returned an error");
        }
        HandlerResult::NoMatch | HandlerResult::Skip => {
            tracing::warn!(id = cell.id(), "flow-controlled handler did not match");
        }
    }
}

/// Deliver a handler result through the current element's response
/// promise.
fn deliver_result(cell: &ActorRef, exec: &mut ExecState, res: HandlerResult) {
    let promise = match exec.current.as_mut() {
        Some(current) if !current.mid.is_answered() => {
            let p = ResponsePromise::new(current.sender.clone(), current.mid);
            current.mid.mark_answered();
            p
        }
        _ => {
            tracing::debug!(id = cell.id(), "suppress response: no pending promise");
            return;
        }
    };
    match res {
        HandlerResult::Value(m) => promise.deliver(m),
        HandlerResult::Error(e) => promise.deliver_error(e),
        HandlerResult::NoMatch => promise.deliver_error(Error::UnexpectedResponse(Box::new(
            Message::unit(),
        ))),
        HandlerResult::Skip => {}
    }
}

/// Detach the payload of the current element for handler invocation.
fn current_payload(exec: &mut ExecState) -> Message {
    exec.current
        .as_mut()
        .map(|e| e.payload.take_message())
        .unwrap_or_default()
}

// ── Event execution ─────────────────────────────────────────────────────

/// Run one envelope through the pipeline and drain newly acceptable
/// envelopes from the skip cache. Returns `(done, success)`.
pub(crate) fn exec_event(cell: &ActorRef, exec: &mut ExecState, env: Box<Envelope>) -> (bool, bool) {
    let (bhvr, mid) = current_behavior(exec);
    let mut slot = Some(env);
    match invoke_message(cell, exec, &mut slot, &bhvr, mid) {
        InvokeResult::Success => {
            if finished(cell, exec) {
                return (true, true);
            }
            // The handled message may have changed the behavior; retry
            // envelopes skipped earlier.
            while invoke_from_cache(cell, exec) {
                if finished(cell, exec) {
                    return (true, true);
                }
            }
            (false, true)
        }
        InvokeResult::Skipped => {
            let env = slot.take().expect("skipped envelope");
            exec.cache.push_second(env, cell.is_priority_aware());
            (false, false)
        }
        InvokeResult::Dropped => {
            // System messages report as dropped but may still have
            // terminated the actor.
            if finished(cell, exec) {
                return (true, false);
            }
            (false, false)
        }
    }
}

pub(crate) fn current_behavior(exec: &ExecState) -> (Behavior, MessageId) {
    if exec.awaits_response() {
        let (mid, bhvr) = exec.awaited.front().expect("awaits_response checked");
        (bhvr.clone(), *mid)
    } else {
        (
            exec.bhvr_stack.last().cloned().unwrap_or_else(Behavior::empty),
            MessageId::make(),
        )
    }
}

/// Retry envelopes in the skip cache, in order. Returns `true` if one was
/// handled (the caller re-scans, since the behavior may have changed
/// again).
pub(crate) fn invoke_from_cache(cell: &ActorRef, exec: &mut ExecState) -> bool {
    let (bhvr, mid) = current_behavior(exec);
    let mut idx = 0;
    while idx < exec.cache.second.len() {
        let env = exec
            .cache
            .second
            .remove(idx)
            .expect("index bounded by len");
        let mut slot = Some(env);
        match invoke_message(cell, exec, &mut slot, &bhvr, mid) {
            InvokeResult::Success => return true,
            InvokeResult::Skipped => {
                let env = slot.take().expect("skipped envelope");
                exec.cache.second.insert(idx, env);
                idx += 1;
            }
            InvokeResult::Dropped => {}
        }
    }
    false
}

// ── Termination ─────────────────────────────────────────────────────────

/// `true` once the actor has neither behavior nor pending responses, or
/// has set an exit reason. Performs cleanup on the transition.
pub(crate) fn finished(cell: &ActorRef, exec: &mut ExecState) -> bool {
    if exec.has_behavior() && !cell.is_terminated() {
        return false;
    }
    exec.bhvr_stack.clear();
    let reason = std::mem::take(&mut exec.fail_state);
    cleanup(cell, exec, reason);
    true
}

/// Tear the actor down. Idempotent: the second call is a no-op.
pub(crate) fn cleanup(cell: &ActorRef, exec: &mut ExecState, reason: ExitReason) -> bool {
    if cell.is_cleaned_up() {
        return false;
    }
    cell.mark_cleaned_up();
    cell.mark_terminated();
    tracing::debug!(id = cell.id(), %reason, "cleanup");
    if cell.is_detached() && !cell.is_blocking() {
        let pt = {
            let slot = cell.private_thread.lock().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        if let Some(pt) = pt {
            pt.shutdown();
        }
    }
    exec.generators.clear();
    exec.current = None;
    if !cell.mailbox.closed() {
        cell.mailbox.close(|env| {
            if env.mid.is_request() {
                actor::bounce_request(env.sender.clone(), env.mid);
            }
        });
    }
    for env in exec.cache.drain_all() {
        if env.mid.is_request() {
            actor::bounce_request(env.sender.clone(), env.mid);
        }
    }
    exec.awaited.clear();
    exec.multiplexed.clear();
    let addr = cell.addr();
    for group in exec.subscriptions.drain(..) {
        group.unsubscribe(&addr);
    }
    if cell.is_registered() {
        cell.system.registry().erase(cell.id());
        cell.set_registered(false);
    }
    monitor::fire_hooks(cell, reason);
    cell.system.registry().dec_running();
    true
}

// ── Handler slots ───────────────────────────────────────────────────────

// Handlers are taken out of their slot for the duration of a call so the
// callee can replace itself; the old handler is restored only if the slot
// is still empty afterwards.

pub(crate) fn run_error_handler(cell: &ActorRef, exec: &mut ExecState, err: Error) {
    match exec.error_handler.take() {
        Some(mut h) => {
            h(&mut Scope::new(cell, exec), err);
            if exec.error_handler.is_none() {
                exec.error_handler = Some(h);
            }
        }
        None => {
            // No error is silently lost: the default action is to quit.
            Scope::new(cell, exec).quit(ExitReason::Error(err));
        }
    }
}

pub(crate) fn run_down_handler(cell: &ActorRef, exec: &mut ExecState, dm: DownMsg) {
    match exec.down_handler.take() {
        Some(mut h) => {
            h(&mut Scope::new(cell, exec), dm);
            if exec.down_handler.is_none() {
                exec.down_handler = Some(h);
            }
        }
        None => {
            tracing::warn!(
                id = cell.id(),
                name = cell.name(),
                source = dm.source.id(),
                reason = %dm.reason,
                "unhandled down message"
            );
        }
    }
}

pub(crate) fn run_exit_handler(cell: &ActorRef, exec: &mut ExecState, em: ExitMsg) {
    match exec.exit_handler.take() {
        Some(mut h) => {
            h(&mut Scope::new(cell, exec), em);
            if exec.exit_handler.is_none() {
                exec.exit_handler = Some(h);
            }
        }
        None => {
            if em.reason.is_failure() {
                Scope::new(cell, exec).quit(em.reason);
            }
        }
    }
}

fn run_default_handler(
    cell: &ActorRef,
    exec: &mut ExecState,
    payload: &mut Message,
) -> HandlerResult {
    match exec.default_override.take() {
        Some(mut h) => {
            let reply = h(&mut Scope::new(cell, exec), payload);
            if exec.default_override.is_none() {
                exec.default_override = Some(h);
            }
            reply.into()
        }
        None => {
            let f = exec.default_handler_fn;
            f(&mut Scope::new(cell, exec), payload).into()
        }
    }
}

/// Map an escaped panic payload to an exit reason, consulting the
/// user-installed exception handler first.
pub(crate) fn map_exception(
    cell: &ActorRef,
    exec: &mut ExecState,
    payload: &(dyn std::any::Any + Send),
) -> ExitReason {
    let what = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string());
    tracing::info!(id = cell.id(), what, "actor died of an exception");
    if let Some(mut h) = exec.exception_handler.take() {
        let mapped = h(&mut Scope::new(cell, exec), payload);
        if exec.exception_handler.is_none() {
            exec.exception_handler = Some(h);
        }
        if let Some(reason) = mapped {
            return reason;
        }
    }
    ExitReason::UnhandledException
}
