//! Credit-based flow control between stream sources and sinks.
//!
//! A sink hands out credit to its registered sources; every flow-controlled
//! envelope consumes one unit, and acknowledged (empty-reply) envelopes
//! return it to the open pool. At or below the low watermark the sink
//! redistributes the pool equally across all live sources; a source that
//! exhausted its grant while the sink is busy gets refilled alone.
//!
//! Invariant: the per-source grants plus `open_credit` always sum to
//! `max_credit`, so `in_flight() = max_credit − open_credit`.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::actor::{ActorAddr, ActorRef, ExecState, StreamSource};
use crate::envelope::{Envelope, MessageId};
use crate::message::{AddSource, CreditGrant, DelSource, Message};
use crate::monitor;

/// Names the two ends of a registered stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub source: ActorAddr,
    pub sink: ActorAddr,
}

/// Register a generator feeding `sink`. Idempotent per sink: a second
/// registration for the same sink is ignored.
pub(crate) fn new_stream(
    cell: &ActorRef,
    exec: &mut ExecState,
    sink: &ActorRef,
    mut generator: Box<dyn FnMut() -> Option<Message> + Send>,
) -> StreamHandle {
    let handle = StreamHandle {
        source: cell.addr(),
        sink: sink.addr(),
    };
    if exec.generators.contains_key(&sink.id()) {
        tracing::warn!(
            id = cell.id(),
            sink = sink.id(),
            "multiple new_stream calls for the same sink"
        );
        return handle;
    }
    let sink_strong = Arc::clone(sink);
    let self_strong = Arc::clone(cell);
    let produce = move || -> bool {
        match generator() {
            Some(payload) => {
                sink_strong.enqueue(Envelope::make(
                    Some(Arc::clone(&self_strong)),
                    MessageId::flow_controlled(),
                    payload,
                ));
                true
            }
            None => false,
        }
    };
    exec.generators.insert(
        sink.id(),
        StreamSource {
            produce: Box::new(produce),
            // An actor with an open stream must stay alive until the
            // stream finishes or cleanup clears the table.
            keepalive: Arc::clone(cell),
        },
    );
    sink.enqueue(Envelope::make(
        Some(Arc::clone(cell)),
        MessageId::make(),
        Message::new(AddSource),
    ));
    handle
}

/// `(sys, add-source)` at the sink: register the sender, hand it any open
/// credit, and arrange for a del-source self-message when it terminates.
pub(crate) fn on_add_source(cell: &ActorRef, exec: &mut ExecState, env: &mut Envelope) {
    let Some(sender) = env.sender.clone() else {
        tracing::error!(id = cell.id(), "received add-source from anonymous sender");
        return;
    };
    if !env.stages.is_empty() {
        tracing::error!(id = cell.id(), "received multi-staged add-source");
        return;
    }
    let src_addr = sender.addr();
    match exec.sources.entry(src_addr.clone()) {
        Entry::Occupied(_) => {
            tracing::error!(
                id = cell.id(),
                source = src_addr.id(),
                "duplicate add-source"
            );
            return;
        }
        Entry::Vacant(slot) => {
            slot.insert(exec.open_credit);
        }
    }
    if exec.open_credit > 0 {
        sender.enqueue(Envelope::make(
            Some(Arc::clone(cell)),
            MessageId::make(),
            Message::new(CreditGrant {
                amount: exec.open_credit,
            }),
        ));
        exec.open_credit = 0;
    }
    // When the source dies, the sink reclaims its outstanding grant via a
    // del-source self-message.
    let weak_sink = cell.addr();
    monitor::attach_cleanup(
        &sender,
        Box::new(move |_reason| {
            if let Some(sink) = weak_sink.upgrade() {
                sink.enqueue(Envelope::make(
                    None,
                    MessageId::make(),
                    Message::new(DelSource { source: src_addr }),
                ));
            }
        }),
    );
}

/// `(sys, del-source, addr)` at the sink: reclaim the source's remaining
/// grant and rebalance. Unknown sources are ignored.
pub(crate) fn on_del_source(cell: &ActorRef, exec: &mut ExecState, source: &ActorAddr) {
    let Some(released) = exec.sources.remove(source) else {
        return;
    };
    grant_credit(cell, exec, released, None);
}

/// `(sys, get, n)` at a source: run the generator `n` times. A generator
/// that runs dry marks the stream finished and is removed.
pub(crate) fn on_credit_granted(cell: &ActorRef, exec: &mut ExecState, env: &mut Envelope) {
    let Some(sender) = env.sender.clone() else {
        tracing::error!(id = cell.id(), "received credit grant from anonymous sender");
        return;
    };
    let amount = env
        .payload
        .get::<CreditGrant>()
        .map_or(0, |g| g.amount);
    let mut exhausted = false;
    match exec.generators.get_mut(&sender.id()) {
        None => {
            tracing::info!(
                id = cell.id(),
                sink = sender.id(),
                "dropped credit grant from unknown sink"
            );
            return;
        }
        Some(stream) => {
            for _ in 0..amount {
                if !(stream.produce)() {
                    exhausted = true;
                    break;
                }
            }
        }
    }
    if exhausted {
        exec.generators.remove(&sender.id());
    }
}

/// Return credit to the open pool and decide who gets it next.
///
/// `cause` is the source whose message was just acknowledged. If it ran
/// out of credit while the sink is still above the low watermark, only it
/// is refilled. At or below the watermark the whole pool is split equally
/// among all live sources; grants held by dead sources are reclaimed
/// first.
pub(crate) fn grant_credit(
    cell: &ActorRef,
    exec: &mut ExecState,
    newly_available: u64,
    cause: Option<ActorAddr>,
) {
    exec.open_credit += newly_available;
    let above_low_watermark = exec.in_flight() > exec.low_watermark;
    if let Some(cause_addr) = cause {
        if let Some(grant) = exec.sources.get_mut(&cause_addr) {
            *grant = grant.saturating_sub(newly_available);
            if *grant == 0 && above_low_watermark {
                if let Some(source) = cause_addr.upgrade() {
                    *grant = exec.open_credit;
                    source.enqueue(Envelope::make(
                        Some(Arc::clone(cell)),
                        MessageId::make(),
                        Message::new(CreditGrant {
                            amount: exec.open_credit,
                        }),
                    ));
                    exec.open_credit = 0;
                }
                return;
            }
        }
    }
    if above_low_watermark || exec.sources.is_empty() {
        return;
    }
    // Below the watermark: reclaim grants of dead sources, then split the
    // pool across the survivors.
    let mut live: Vec<(ActorAddr, ActorRef)> = Vec::new();
    {
        let sources = &mut exec.sources;
        let open_credit = &mut exec.open_credit;
        sources.retain(|addr, grant| match addr.upgrade() {
            Some(strong) => {
                live.push((addr.clone(), strong));
                true
            }
            None => {
                *open_credit += *grant;
                false
            }
        });
    }
    if live.is_empty() || exec.open_credit == 0 {
        return;
    }
    // If the pool cannot be split across everyone, advance at least some
    // sources.
    let mut credit = exec.open_credit / live.len() as u64;
    while credit == 0 {
        live.pop();
        if live.is_empty() {
            return;
        }
        credit = exec.open_credit / live.len() as u64;
    }
    tracing::debug!(id = cell.id(), credit, sources = live.len(), "grant more credit");
    for (addr, strong) in &live {
        if let Some(grant) = exec.sources.get_mut(addr) {
            *grant += credit;
        }
        strong.enqueue(Envelope::make(
            Some(Arc::clone(cell)),
            MessageId::make(),
            Message::new(CreditGrant { amount: credit }),
        ));
    }
    exec.open_credit -= credit * live.len() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ExecState;
    use crate::behavior::{Behavior, Reply};
    use crate::config::RuntimeConfig;
    use crate::scope::Scope;
    use crate::system::{ActorSystem, SpawnOptions};

    /// A parked actor whose exec state we can poke at directly.
    fn idle_actor(system: &ActorSystem) -> ActorRef {
        system.spawn_opts(
            SpawnOptions::default().lazy().hidden(),
            |_scope: &mut Scope<'_>| {
                Behavior::new()
                    .on::<u8, _>(|_scope: &mut Scope<'_>, _v: &mut u8| Reply::Done)
                    .build()
            },
        )
    }

    fn credit_sum(exec: &ExecState) -> u64 {
        exec.sources.values().sum::<u64>() + exec.open_credit
    }

    #[test]
    fn grant_credit_preserves_the_pool() {
        let system =
            ActorSystem::new(RuntimeConfig::default().with_threads(1).with_credit(50, 10));
        let sink = idle_actor(&system);
        let s1 = idle_actor(&system);
        let s2 = idle_actor(&system);
        {
            let mut guard = sink.exec.lock().expect("uncontended");
            let exec = &mut *guard;
            exec.sources.insert(s1.addr(), 30);
            exec.sources.insert(s2.addr(), 20);
            exec.open_credit = 0;
            assert_eq!(credit_sum(exec), 50);

            // Above the watermark with credit remaining: nothing moves.
            grant_credit(&sink, exec, 5, Some(s1.addr()));
            assert_eq!(credit_sum(exec), 50);
            assert_eq!(exec.sources[&s1.addr()], 25);
            assert_eq!(exec.open_credit, 5);

            // Cause ran dry above the watermark: only the cause refills.
            grant_credit(&sink, exec, 25, Some(s1.addr()));
            assert_eq!(credit_sum(exec), 50);
            assert_eq!(exec.sources[&s1.addr()], 30);
            assert_eq!(exec.open_credit, 0);
        }
        system.shutdown();
    }

    #[test]
    fn below_watermark_redistributes_equally() {
        let system =
            ActorSystem::new(RuntimeConfig::default().with_threads(1).with_credit(50, 10));
        let sink = idle_actor(&system);
        let s1 = idle_actor(&system);
        let s2 = idle_actor(&system);
        {
            let mut guard = sink.exec.lock().expect("uncontended");
            let exec = &mut *guard;
            exec.sources.insert(s1.addr(), 45);
            exec.sources.insert(s2.addr(), 5);
            exec.open_credit = 0;

            // 45 acknowledged at once drops in-flight to 5 <= 10.
            grant_credit(&sink, exec, 45, Some(s1.addr()));
            assert_eq!(credit_sum(exec), 50);
            assert_eq!(exec.sources[&s1.addr()], 22);
            assert_eq!(exec.sources[&s2.addr()], 27);
            assert_eq!(exec.open_credit, 1);
        }
        system.shutdown();
    }

    #[test]
    fn dead_sources_are_reclaimed_before_redistribution() {
        let system =
            ActorSystem::new(RuntimeConfig::default().with_threads(1).with_credit(50, 10));
        let sink = idle_actor(&system);
        let s1 = idle_actor(&system);
        let s2 = idle_actor(&system);
        let s2_addr = s2.addr();
        drop(s2);
        {
            let mut guard = sink.exec.lock().expect("uncontended");
            let exec = &mut *guard;
            exec.sources.insert(s1.addr(), 45);
            exec.sources.insert(s2_addr, 5);
            exec.open_credit = 0;

            grant_credit(&sink, exec, 45, Some(s1.addr()));
            // The dead source's grant flowed back into the pool and on to
            // the survivor.
            assert_eq!(credit_sum(exec), 50);
            assert_eq!(exec.sources.len(), 1);
            assert_eq!(exec.sources[&s1.addr()], 50);
            assert_eq!(exec.open_credit, 0);
        }
        system.shutdown();
    }
}
