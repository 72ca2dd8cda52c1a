//! Blocking-style actors.
//!
//! A blocking actor runs a user body on its own thread and pulls messages
//! synchronously: `receive` installs a behavior and dequeues until it
//! handled one message (or its idle timeout fired), `request_await` parks
//! the actor at a specific response id. `quit` unwinds the body through a
//! dedicated panic payload that the driver catches; it never escapes the
//! thread.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::actor::{ActorRef, ExecState};
use crate::behavior::Behavior;
use crate::dispatch;
use crate::envelope::Envelope;
use crate::message::Message;
use crate::scope::Scope;

/// Internal stack-unwinding sentinel thrown by `quit` on blocking actors.
pub(crate) struct BlockingUnwind;

pub(crate) fn unwind_blocking() -> ! {
    std::panic::panic_any(BlockingUnwind)
}

/// Self context of a blocking actor: everything a [`Scope`] offers plus
/// synchronous receive primitives.
pub struct BlockingScope<'a> {
    scope: Scope<'a>,
}

impl<'a> Deref for BlockingScope<'a> {
    type Target = Scope<'a>;

    fn deref(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a> DerefMut for BlockingScope<'a> {
    fn deref_mut(&mut self) -> &mut Scope<'a> {
        &mut self.scope
    }
}

impl<'a> BlockingScope<'a> {
    /// Install `bhvr` and dequeue until it handled exactly one message.
    /// An idle timeout on the behavior bounds the wait: when it fires and
    /// the callback installs nothing new, the receive returns.
    ///
    /// Envelopes skipped by an earlier receive are retried first, so a
    /// behavior change picks them up before any new envelope.
    pub fn receive(&mut self, bhvr: Behavior) {
        let (cell, exec) = self.scope_parts();
        dispatch::do_become(cell, exec, bhvr.clone(), false);
        let depth = exec.bhvr_stack.len();
        if dispatch::invoke_from_cache(cell, exec) {
            finish_receive(exec, depth, &bhvr);
            return;
        }
        loop {
            // The timeout auto-pop (or a handler-driven unbecome) ends the
            // receive.
            if exec.bhvr_stack.len() < depth {
                return;
            }
            match cell
                .mailbox
                .next_message(&mut exec.cache, cell.is_priority_aware())
            {
                Some(env) => {
                    let (top, mid) = dispatch::current_behavior(exec);
                    let mut slot = Some(env);
                    match dispatch::invoke_message(cell, exec, &mut slot, &top, mid) {
                        dispatch::InvokeResult::Success => {
                            finish_receive(exec, depth, &bhvr);
                            return;
                        }
                        dispatch::InvokeResult::Skipped => {
                            let env = slot.take().expect("skipped envelope");
                            exec.cache.push_second(env, cell.is_priority_aware());
                        }
                        dispatch::InvokeResult::Dropped => {}
                    }
                }
                None => await_data(cell),
            }
        }
    }

    /// Send a request and block this actor until its response arrives and
    /// `on_response` ran. Ordinary messages arriving meanwhile are cached
    /// for later; a timeout on `on_response` converts into a
    /// [`RequestTimeout`](crate::Error::RequestTimeout) response.
    pub fn request_await<T: Any + Send + Clone>(
        &mut self,
        dest: &ActorRef,
        payload: T,
        on_response: Behavior,
    ) {
        let (cell, exec) = self.scope_parts();
        let mid = exec.new_request_id(false);
        let response_id = mid.response_id();
        dest.enqueue(Envelope::make(
            Some(std::sync::Arc::clone(cell)),
            mid,
            Message::new(payload),
        ));
        if let Some(d) = on_response.timeout() {
            cell.system.clock().delayed_send(
                d,
                Some(std::sync::Arc::clone(cell)),
                cell.addr(),
                response_id,
                Message::new(crate::error::Error::RequestTimeout),
            );
        }
        exec.awaited.push_front((response_id, on_response));
        // Spin one envelope at a time until the handler for this id fired.
        while exec.awaited.iter().any(|(id, _)| *id == response_id) {
            match cell
                .mailbox
                .next_message(&mut exec.cache, cell.is_priority_aware())
            {
                Some(env) => {
                    let (top, mid) = dispatch::current_behavior(exec);
                    let mut slot = Some(env);
                    match dispatch::invoke_message(cell, exec, &mut slot, &top, mid) {
                        dispatch::InvokeResult::Skipped => {
                            let env = slot.take().expect("skipped envelope");
                            exec.cache.push_second(env, cell.is_priority_aware());
                        }
                        dispatch::InvokeResult::Success | dispatch::InvokeResult::Dropped => {}
                    }
                }
                None => await_data(cell),
            }
        }
    }

    fn scope_parts(&mut self) -> (&ActorRef, &mut ExecState) {
        (self.scope.cell, &mut *self.scope.exec)
    }
}

/// Uninstall the receive behavior unless the handled message already
/// changed the stack (timeout auto-pop or an explicit become).
fn finish_receive(exec: &mut ExecState, depth: usize, bhvr: &Behavior) {
    if exec.bhvr_stack.len() >= depth && exec.bhvr_stack.last().is_some_and(|top| top.same(bhvr)) {
        exec.bhvr_stack.pop();
    }
}

/// Park the blocking actor until its mailbox has something to fetch.
fn await_data(cell: &ActorRef) {
    let mut guard = cell.sleep.lock.lock().unwrap_or_else(|e| e.into_inner());
    if !cell.mailbox.try_block() {
        // New data raced in; nothing to wait for.
        return;
    }
    while !cell.mailbox.can_fetch_more() {
        guard = cell.sleep.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
    }
}

/// Thread body for a blocking actor: run the user function, translate its
/// ending into an exit reason, clean up.
pub(crate) fn run_blocking(cell: ActorRef, body: Box<dyn FnOnce(&mut BlockingScope<'_>) + Send>) {
    cell.mark_initialized();
    let mut guard = cell.exec.lock().unwrap_or_else(|e| e.into_inner());
    let outcome = {
        let exec = &mut *guard;
        catch_unwind(AssertUnwindSafe(|| {
            let mut scope = BlockingScope {
                scope: Scope::new(&cell, exec),
            };
            body(&mut scope);
        }))
    };
    let exec = &mut *guard;
    let reason = match outcome {
        Ok(()) => std::mem::take(&mut exec.fail_state),
        Err(payload) => {
            if payload.is::<BlockingUnwind>() {
                // quit() unwound us; the reason is already recorded.
                std::mem::take(&mut exec.fail_state)
            } else {
                let reason = dispatch::map_exception(&cell, exec, payload.as_ref());
                cell.mark_terminated();
                reason
            }
        }
    };
    dispatch::cleanup(&cell, exec, reason);
}
