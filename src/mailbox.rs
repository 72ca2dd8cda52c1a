//! Lock-free MPSC mailbox with a blockable reader and a two-segment cache.
//!
//! Producers push onto a LIFO stack with a single CAS; the consumer flushes
//! the stack in one swap and reverses it into arrival order. The stack head
//! doubles as the state word: two marker values encode *reader blocked* and
//! *queue closed*, so the empty→blocked and blocked→nonempty transitions
//! are single atomic operations with no window for lost wakeups or double
//! schedules.
//!
//! The cache is owned by the consumer and split in two segments: the
//! *first* holds envelopes whose priority order has already been
//! materialized (the head section served by `next_message`), the *second*
//! holds envelopes a handler skipped, kept for retry after a behavior
//! change. Arrival order is preserved within each priority class.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::envelope::Envelope;

/// Outcome of [`Mailbox::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Enqueued into a queue somebody is already draining.
    Success,
    /// The mailbox went from empty-and-blocked to nonempty: the caller
    /// must reschedule the actor.
    UnblockedReader,
    /// The mailbox was closed; request envelopes must be bounced.
    QueueClosed,
}

// Marker head values. Envelopes are Box-allocated and thus aligned well
// above 0x2, so these can never collide with a real node.
const EMPTY: *mut Envelope = std::ptr::null_mut();
const BLOCKED: *mut Envelope = 1 as *mut Envelope;
const CLOSED: *mut Envelope = 2 as *mut Envelope;

fn is_marker(p: *mut Envelope) -> bool {
    p == EMPTY || p == BLOCKED || p == CLOSED
}

/// Multi-producer / single-consumer envelope queue.
pub struct Mailbox {
    head: AtomicPtr<Envelope>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            head: AtomicPtr::new(EMPTY),
        }
    }

    /// Push an envelope. Safe for concurrent producers.
    pub fn enqueue(&self, env: Box<Envelope>) -> EnqueueResult {
        let node = Box::into_raw(env);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == CLOSED {
                // SAFETY: `node` came from Box::into_raw above and was
                // never published.
                drop(unsafe { Box::from_raw(node) });
                return EnqueueResult::QueueClosed;
            }
            let next = if head == BLOCKED { EMPTY } else { head };
            // SAFETY: `node` is exclusively owned until the CAS below
            // publishes it.
            unsafe { (*node).next.store(next, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if head == BLOCKED {
                        EnqueueResult::UnblockedReader
                    } else {
                        EnqueueResult::Success
                    };
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Atomically mark the mailbox blocked iff it is empty. Returns whether
    /// the transition succeeded; a later [`enqueue`](Mailbox::enqueue)
    /// unblocks it and reports `UnblockedReader` exactly once.
    pub fn try_block(&self) -> bool {
        self.head
            .compare_exchange(EMPTY, BLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` once [`close`](Mailbox::close) ran.
    pub fn closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == CLOSED
    }

    /// `true` if the shared stack holds at least one envelope (the cache
    /// is not consulted).
    pub fn can_fetch_more(&self) -> bool {
        !is_marker(self.head.load(Ordering::Acquire))
    }

    /// Close the mailbox, feeding every still-queued envelope to
    /// `bouncer`. Idempotent; subsequent enqueues observe `QueueClosed`.
    pub fn close<F: FnMut(Box<Envelope>)>(&self, mut bouncer: F) {
        let old = self.head.swap(CLOSED, Ordering::AcqRel);
        for env in chain_to_fifo(old) {
            bouncer(env);
        }
    }

    /// Take the whole shared stack in arrival (FIFO) order. Single
    /// consumer only.
    fn fetch_chain(&self) -> Vec<Box<Envelope>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if is_marker(head) {
                return Vec::new();
            }
            match self
                .head
                .compare_exchange_weak(head, EMPTY, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(taken) => return chain_to_fifo(taken),
                Err(actual) => head = actual,
            }
        }
    }

    /// Pop the next envelope in arrival order, refilling the first cache
    /// segment from the shared stack when it runs dry.
    pub(crate) fn try_pop(&self, cache: &mut Cache) -> Option<Box<Envelope>> {
        if cache.first.is_empty() {
            cache.first.extend(self.fetch_chain());
        }
        cache.first.pop_front()
    }

    /// Priority-aware dequeue: drain everything currently queued into the
    /// first cache segment, high-priority envelopes (in arrival order)
    /// ahead of low-priority ones, then return the head. Non-priority
    /// callers use [`try_pop`](Mailbox::try_pop) instead.
    pub(crate) fn next_message(
        &self,
        cache: &mut Cache,
        priority_aware: bool,
    ) -> Option<Box<Envelope>> {
        if !priority_aware {
            return self.try_pop(cache);
        }
        // If the head of the first segment is already high priority there
        // is nothing a drain could put in front of it.
        if cache.first.front().is_none_or(|e| !e.is_high_priority()) {
            let mut hp_pos = cache.first.iter().take_while(|e| e.is_high_priority()).count();
            for env in self.fetch_chain() {
                if env.is_high_priority() {
                    cache.first.insert(hp_pos, env);
                    hp_pos += 1;
                } else {
                    cache.first.push_back(env);
                }
            }
        }
        cache.first.pop_front()
    }

    /// `true` if either the first cache segment or the shared stack has a
    /// deliverable envelope. Skipped envelopes do not count.
    pub(crate) fn has_next_message(&self, cache: &Cache) -> bool {
        !cache.first.is_empty() || self.can_fetch_more()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox::new()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let old = self.head.swap(CLOSED, Ordering::AcqRel);
        drop(chain_to_fifo(old));
    }
}

/// Walk an intrusive chain, reclaiming each node and reversing the LIFO
/// publication order back into arrival order.
fn chain_to_fifo(head: *mut Envelope) -> Vec<Box<Envelope>> {
    let mut out = Vec::new();
    let mut cur = head;
    while !is_marker(cur) {
        // SAFETY: every non-marker pointer reachable from the head was
        // published by `enqueue` from Box::into_raw and is owned by the
        // single consumer once detached from the shared head.
        let env = unsafe { Box::from_raw(cur) };
        cur = env.next.load(Ordering::Relaxed);
        out.push(env);
    }
    out.reverse();
    out
}

// ── Consumer-side cache ─────────────────────────────────────────────────

/// Two-segment envelope cache owned by the consuming actor.
#[derive(Default)]
pub(crate) struct Cache {
    /// Priority-materialized head section; `next_message` serves from here.
    pub(crate) first: std::collections::VecDeque<Box<Envelope>>,
    /// Envelopes skipped by a handler, retried after behavior changes.
    pub(crate) second: std::collections::VecDeque<Box<Envelope>>,
}

impl Cache {
    pub(crate) fn new() -> Self {
        Cache::default()
    }

    /// Append a skipped envelope to the second segment. With
    /// `priority_aware`, high-priority envelopes are inserted at the
    /// partition point so they stay ahead of low-priority ones while
    /// preserving arrival order within their class.
    pub(crate) fn push_second(&mut self, env: Box<Envelope>, priority_aware: bool) {
        if priority_aware && env.is_high_priority() {
            let pos = self
                .second
                .iter()
                .take_while(|e| e.is_high_priority())
                .count();
            self.second.insert(pos, env);
        } else {
            self.second.push_back(env);
        }
    }

    /// Drain both segments, oldest first. Used by cleanup to bounce
    /// pending requests.
    pub(crate) fn drain_all(&mut self) -> impl Iterator<Item = Box<Envelope>> + '_ {
        self.first.drain(..).chain(self.second.drain(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageId;
    use crate::message::Message;

    fn env(tag: u32) -> Box<Envelope> {
        Envelope::make(None, MessageId::make(), Message::new(tag))
    }

    fn hp_env(tag: u32) -> Box<Envelope> {
        Envelope::make(
            None,
            MessageId::make().with_high_priority(),
            Message::new(tag),
        )
    }

    fn tag(e: &Envelope) -> u32 {
        *e.payload.get::<u32>().expect("test payload")
    }

    #[test]
    fn fifo_arrival_order() {
        let mb = Mailbox::new();
        let mut cache = Cache::new();
        for i in 0..5 {
            assert_eq!(mb.enqueue(env(i)), EnqueueResult::Success);
        }
        for i in 0..5 {
            let e = mb.try_pop(&mut cache).expect("queued");
            assert_eq!(tag(&e), i);
        }
        assert!(mb.try_pop(&mut cache).is_none());
    }

    #[test]
    fn block_then_unblock_reports_once() {
        let mb = Mailbox::new();
        assert!(mb.try_block());
        // Blocking twice must fail: the queue is no longer empty-or-open.
        assert!(!mb.try_block());
        assert_eq!(mb.enqueue(env(1)), EnqueueResult::UnblockedReader);
        assert_eq!(mb.enqueue(env(2)), EnqueueResult::Success);
    }

    #[test]
    fn try_block_fails_when_nonempty() {
        let mb = Mailbox::new();
        mb.enqueue(env(1));
        assert!(!mb.try_block());
    }

    #[test]
    fn close_bounces_queued_and_rejects_later_sends() {
        let mb = Mailbox::new();
        mb.enqueue(env(1));
        mb.enqueue(env(2));
        let mut bounced = Vec::new();
        mb.close(|e| bounced.push(tag(&e)));
        assert_eq!(bounced, vec![1, 2]);
        assert!(mb.closed());
        assert_eq!(mb.enqueue(env(3)), EnqueueResult::QueueClosed);
        // Idempotent.
        mb.close(|_| panic!("nothing left to bounce"));
    }

    #[test]
    fn priority_dequeue_partitions_batch() {
        let mb = Mailbox::new();
        let mut cache = Cache::new();
        mb.enqueue(env(1));
        mb.enqueue(hp_env(100));
        mb.enqueue(env(2));
        mb.enqueue(hp_env(101));

        let order: Vec<u32> = std::iter::from_fn(|| mb.next_message(&mut cache, true))
            .map(|e| tag(&e))
            .collect();
        assert_eq!(order, vec![100, 101, 1, 2]);
    }

    #[test]
    fn non_priority_dequeue_keeps_arrival_order() {
        let mb = Mailbox::new();
        let mut cache = Cache::new();
        mb.enqueue(env(1));
        mb.enqueue(hp_env(100));
        mb.enqueue(env(2));
        let order: Vec<u32> = std::iter::from_fn(|| mb.next_message(&mut cache, false))
            .map(|e| tag(&e))
            .collect();
        assert_eq!(order, vec![1, 100, 2]);
    }

    #[test]
    fn skipped_high_priority_stays_ahead_in_second_segment() {
        let mut cache = Cache::new();
        cache.push_second(env(1), true);
        cache.push_second(hp_env(100), true);
        cache.push_second(env(2), true);
        cache.push_second(hp_env(101), true);
        let order: Vec<u32> = cache.drain_all().map(|e| tag(&e)).collect();
        assert_eq!(order, vec![100, 101, 1, 2]);
    }

    #[test]
    fn concurrent_producers_preserve_per_sender_fifo() {
        use std::sync::Arc;
        let mb = Arc::new(Mailbox::new());
        let mut handles = Vec::new();
        for t in 0..4_u32 {
            let mb = Arc::clone(&mb);
            handles.push(std::thread::spawn(move || {
                for i in 0..100_u32 {
                    mb.enqueue(env(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().expect("producer");
        }
        let mut cache = Cache::new();
        let mut last_per_sender = std::collections::HashMap::new();
        let mut total = 0;
        while let Some(e) = mb.try_pop(&mut cache) {
            let v = tag(&e);
            let sender = v / 1000;
            let prev = last_per_sender.insert(sender, v);
            if let Some(p) = prev {
                assert!(v > p, "per-sender FIFO violated: {p} then {v}");
            }
            total += 1;
        }
        assert_eq!(total, 400);
    }
}
