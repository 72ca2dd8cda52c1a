//! Delayed sends.
//!
//! One dedicated thread owns a deadline-ordered queue of pending sends
//! and sleeps on a condvar until the earliest deadline (or a new, earlier
//! entry arrives). Receivers are held weakly: a send whose receiver died
//! before the deadline is dropped at fire time.

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::actor::{ActorAddr, ActorRef};
use crate::envelope::{Envelope, MessageId};
use crate::message::Message;

struct Schedule {
    deadline: Instant,
    /// Tie-break so equal deadlines fire in submission order.
    seq: u64,
    sender: Option<ActorRef>,
    receiver: ActorAddr,
    mid: MessageId,
    payload: Message,
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Schedule {}

impl PartialOrd for Schedule {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Schedule {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ClockState {
    queue: BinaryHeap<Schedule>,
    next_seq: u64,
    shutdown: bool,
}

struct ClockCore {
    state: Mutex<ClockState>,
    cv: Condvar,
}

/// Handle on the delayed-send thread.
pub struct Clock {
    core: Arc<ClockCore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Clock {
    pub(crate) fn start() -> Clock {
        let core = Arc::new(ClockCore {
            state: Mutex::new(ClockState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let core_for_thread = Arc::clone(&core);
        let handle = std::thread::Builder::new()
            .name("rookery-clock".to_string())
            .spawn(move || clock_loop(&core_for_thread))
            .ok();
        Clock {
            core,
            handle: Mutex::new(handle),
        }
    }

    /// Deliver `payload` to `receiver` after `delay`.
    pub fn delayed_send(
        &self,
        delay: Duration,
        sender: Option<ActorRef>,
        receiver: ActorAddr,
        mid: MessageId,
        payload: Message,
    ) {
        let mut st = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.shutdown {
            tracing::debug!("dropped delayed send after clock shutdown");
            return;
        }
        st.next_seq += 1;
        let seq = st.next_seq;
        st.queue.push(Schedule {
            deadline: Instant::now() + delay,
            seq,
            sender,
            receiver,
            mid,
            payload,
        });
        drop(st);
        self.core.cv.notify_one();
    }

    /// Stop the clock thread; pending sends are discarded.
    pub fn shutdown(&self) {
        {
            let mut st = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
            st.shutdown = true;
        }
        self.core.cv.notify_one();
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = handle.take() {
            let _ = h.join();
        }
    }
}

fn clock_loop(core: &Arc<ClockCore>) {
    let mut st = core.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        match st.queue.peek().map(|s| s.deadline) {
            None => {
                st = core.cv.wait(st).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) if deadline > now => {
                let (guard, _timeout) = core
                    .cv
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                st = guard;
            }
            Some(_) => {
                // Collect everything due, then fire outside the lock so a
                // fired envelope can schedule new delayed sends.
                let mut due = Vec::new();
                while st.queue.peek().is_some_and(|s| s.deadline <= now) {
                    due.push(st.queue.pop().expect("peeked entry"));
                }
                drop(st);
                for entry in due {
                    fire(entry);
                }
                st = core.state.lock().unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

fn fire(entry: Schedule) {
    let Some(receiver) = entry.receiver.upgrade() else {
        tracing::trace!(
            receiver = entry.receiver.id(),
            "dropped delayed send to a dead actor"
        );
        return;
    };
    receiver.enqueue(Envelope::make(entry.sender, entry.mid, entry.payload));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_deadline_on_top() {
        let mut heap = BinaryHeap::new();
        let now = Instant::now();
        for (ms, seq) in [(30_u64, 1_u64), (10, 2), (20, 3)] {
            heap.push(Schedule {
                deadline: now + Duration::from_millis(ms),
                seq,
                sender: None,
                receiver: dangling_addr(),
                mid: MessageId::make(),
                payload: Message::unit(),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|s| s.seq).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_deadlines_fire_in_submission_order() {
        let mut heap = BinaryHeap::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        for seq in [1_u64, 2, 3] {
            heap.push(Schedule {
                deadline,
                seq,
                sender: None,
                receiver: dangling_addr(),
                mid: MessageId::make(),
                payload: Message::unit(),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|s| s.seq).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    /// An address whose actor never existed; upgrades to `None`.
    fn dangling_addr() -> ActorAddr {
        crate::actor::ActorAddr::dangling(0)
    }
}
