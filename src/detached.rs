//! Private threads for detached event-based actors.
//!
//! A detached actor owns an OS thread instead of sharing the worker pool.
//! The thread drives `resume` with an unbounded throughput budget and
//! parks on a condition variable between mailbox activity. The state
//! machine mirrors the resumable contract: *active* (work to do),
//! *await-resume-or-shutdown* (parked), *shutdown-requested* (cleanup ran).
//!
//! Both the control block and the thread hold a strong handle to the
//! [`PrivateThread`], so destruction order falls out of the reference
//! counts; the condition variable only sequences the loop.

use std::sync::{Arc, Condvar, Mutex};

use crate::actor::ActorRef;
use crate::scheduler::ResumeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Active,
    ShutdownRequested,
    AwaitResumeOrShutdown,
}

pub(crate) struct PrivateThread {
    state: Mutex<ThreadState>,
    cv: Condvar,
}

impl PrivateThread {
    pub(crate) fn new() -> Arc<PrivateThread> {
        Arc::new(PrivateThread {
            state: Mutex::new(ThreadState::Active),
            cv: Condvar::new(),
        })
    }

    /// Spawn the dedicated thread. The thread keeps `job` alive until the
    /// actor is done.
    pub(crate) fn start(self: Arc<Self>, job: ActorRef) {
        let this = self;
        let name = format!("rookery-private-{}", job.id());
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || this.run(job));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn private thread");
        }
    }

    fn run(&self, job: ActorRef) {
        loop {
            {
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *st == ThreadState::ShutdownRequested {
                    return;
                }
                *st = ThreadState::AwaitResumeOrShutdown;
            }
            loop {
                match job.resume(usize::MAX) {
                    ResumeResult::ResumeLater => continue,
                    ResumeResult::Done | ResumeResult::Shutdown => return,
                    ResumeResult::AwaitingMessage => break,
                }
            }
            // Wait until the actor becomes ready again or cleanup asks us
            // to go away.
            if !self.await_resume() {
                return;
            }
        }
    }

    fn await_resume(&self) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *st == ThreadState::AwaitResumeOrShutdown {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        *st == ThreadState::Active
    }

    /// Called by the enqueue path after unblocking the mailbox.
    pub(crate) fn resume(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *st != ThreadState::ShutdownRequested {
            *st = ThreadState::Active;
        }
        self.cv.notify_one();
    }

    /// Called by cleanup; the thread exits at its next suspension point.
    pub(crate) fn shutdown(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *st = ThreadState::ShutdownRequested;
        self.cv.notify_one();
    }
}
