//! M:N work-stealing worker pool.
//!
//! A fixed set of worker threads cooperatively drives a large set of
//! actors. Each worker owns a Chase-Lev deque; idle workers steal from a
//! random peer, then batch-steal from the shared injector, then park on a
//! per-worker condvar with a timed shutdown recheck.
//!
//! The pool consumes jobs only through the [`Resumable`] contract: it
//! calls `resume` with the configured throughput budget and interprets
//! the result. One strong reference rides along with each queued job; it
//! is dropped when the resume step completes, pairing exactly with the
//! reference the enqueuer added when it rescheduled the actor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

/// Result of one cooperative `resume` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// The actor finished; drop it.
    Done,
    /// Mailbox empty and blocked; the next enqueue reschedules it.
    AwaitingMessage,
    /// Throughput budget exhausted with work pending; reschedule now.
    ResumeLater,
    /// The execution unit itself is shutting down.
    Shutdown,
}

/// Contract between the pool and its jobs. Plain actors never produce
/// [`ResumeResult::Shutdown`]; transport-driven execution units may.
pub trait Resumable: Send + Sync {
    fn resume(self: Arc<Self>, max_throughput: usize) -> ResumeResult;
}

impl Resumable for crate::actor::ActorCell {
    fn resume(self: Arc<Self>, max_throughput: usize) -> ResumeResult {
        crate::actor::ActorCell::resume(self.as_ref(), max_throughput)
    }
}

type Job = Arc<dyn Resumable>;

/// Park timeout — workers recheck the shutdown flag at this interval.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Per-worker parking primitive. Each worker parks on its own lock to
/// avoid contention on a single global one.
struct Parker {
    mutex: Mutex<()>,
    cond: Condvar,
}

/// Pool-wide observability counters.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) jobs_enqueued: AtomicU64,
    pub(crate) jobs_completed: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
}

/// Point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedMetrics {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub steals: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub worker_count: usize,
}

struct PoolCore {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    parkers: Vec<Parker>,
    shutdown: AtomicBool,
    wake_counter: AtomicU64,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    worker_count: usize,
    max_throughput: usize,
    counters: Counters,
}

/// Handle on the worker pool.
pub struct WorkerPool {
    core: Arc<PoolCore>,
}

impl WorkerPool {
    /// Create the deques, collect the stealers, then spawn the workers.
    /// Every deque must exist before any worker runs, since workers steal
    /// from each other.
    pub(crate) fn start(worker_count: usize, max_throughput: usize) -> WorkerPool {
        let mut deques = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let deque: Worker<Job> = Worker::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }
        let parkers = (0..worker_count)
            .map(|_| Parker {
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            })
            .collect();
        let core = Arc::new(PoolCore {
            injector: Injector::new(),
            stealers,
            parkers,
            shutdown: AtomicBool::new(false),
            wake_counter: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
            worker_count,
            max_throughput,
            counters: Counters::default(),
        });
        let mut handles = Vec::with_capacity(worker_count);
        for (id, deque) in deques.into_iter().enumerate() {
            let core_for_worker = Arc::clone(&core);
            let spawned = std::thread::Builder::new()
                .name(format!("rookery-worker-{id}"))
                .spawn(move || worker_loop(id, &deque, &core_for_worker));
            match spawned {
                Ok(h) => handles.push(Some(h)),
                Err(e) => tracing::error!(error = %e, "failed to spawn worker"),
            }
        }
        {
            let mut lock = core.handles.lock().unwrap_or_else(|e| e.into_inner());
            *lock = handles;
        }
        WorkerPool { core }
    }

    /// Hand a job to the pool; a worker will eventually call `resume`.
    pub fn exec_later(&self, job: Job) {
        self.core
            .counters
            .jobs_enqueued
            .fetch_add(1, Ordering::Relaxed);
        self.core.injector.push(job);
        self.try_wake();
    }

    /// Wake one parked worker, round-robining the wake target.
    fn try_wake(&self) {
        let idx = (self.core.wake_counter.fetch_add(1, Ordering::Relaxed)
            % self.core.worker_count as u64) as usize;
        self.core.parkers[idx].cond.notify_one();
    }

    pub(crate) fn note_message_sent(&self) {
        self.core
            .counters
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_message_received(&self) {
        self.core
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> SchedMetrics {
        let c = &self.core.counters;
        SchedMetrics {
            jobs_enqueued: c.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: c.jobs_completed.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            worker_count: self.core.worker_count,
        }
    }

    /// Set the shutdown flag, wake every parked worker, join them all.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        for parker in &self.core.parkers {
            parker.cond.notify_one();
        }
        let mut handles = self.core.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in &mut *handles {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

// ── Worker loop ─────────────────────────────────────────────────────────

fn worker_loop(id: usize, local: &Worker<Job>, core: &Arc<PoolCore>) {
    let mut rng = Xorshift64::new(0x9E37_79B9_7F4A_7C15_u64.wrapping_mul(id as u64 + 1));
    while !core.shutdown.load(Ordering::Acquire) {
        // 1. Pop from the local deque.
        if let Some(job) = local.pop() {
            run_job(core, local, job);
            continue;
        }
        // 2. Steal from a random peer.
        if let Some(job) = try_steal_from_peers(core, id, &mut rng) {
            run_job(core, local, job);
            continue;
        }
        // 3. Batch-steal from the global injector into the local deque.
        if let Some(job) = steal_from_injector(core, local) {
            run_job(core, local, job);
            continue;
        }
        // 4. Park until notified or timeout.
        let parker = &core.parkers[id];
        let guard = parker.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if core.shutdown.load(Ordering::Acquire) {
            break;
        }
        let _ = parker.cond.wait_timeout(guard, PARK_TIMEOUT);
    }
}

fn run_job(core: &Arc<PoolCore>, local: &Worker<Job>, job: Job) {
    match Arc::clone(&job).resume(core.max_throughput) {
        ResumeResult::ResumeLater => {
            // Keep the job on this worker; stealers will spread load.
            local.push(job);
        }
        ResumeResult::Done | ResumeResult::AwaitingMessage | ResumeResult::Shutdown => {
            core.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn try_steal_from_peers(core: &Arc<PoolCore>, self_id: usize, rng: &mut Xorshift64) -> Option<Job> {
    let n = core.worker_count;
    if n <= 1 {
        return None;
    }
    let start = (rng.next_u64() % n as u64) as usize;
    for i in 0..n {
        let victim = (start + i) % n;
        if victim == self_id {
            continue;
        }
        loop {
            match core.stealers[victim].steal() {
                Steal::Success(job) => {
                    core.counters.steals.fetch_add(1, Ordering::Relaxed);
                    return Some(job);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

fn steal_from_injector(core: &Arc<PoolCore>, local: &Worker<Job>) -> Option<Job> {
    loop {
        match core.injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

// ── Xorshift64 PRNG for victim selection ────────────────────────────────

/// Minimal xorshift64 PRNG — one per worker thread.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift64_produces_different_values() {
        let mut rng = Xorshift64::new(42);
        let a = rng.next_u64();
        let b = rng.next_u64();
        let c = rng.next_u64();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    struct CountingJob {
        remaining: AtomicU64,
    }

    impl Resumable for CountingJob {
        fn resume(self: Arc<Self>, _max_throughput: usize) -> ResumeResult {
            if self.remaining.fetch_sub(1, Ordering::AcqRel) > 1 {
                ResumeResult::ResumeLater
            } else {
                ResumeResult::Done
            }
        }
    }

    #[test]
    fn pool_drives_jobs_to_completion() {
        let pool = WorkerPool::start(2, 16);
        let job = Arc::new(CountingJob {
            remaining: AtomicU64::new(5),
        });
        pool.exec_later(Arc::clone(&job) as Job);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while job.remaining.load(Ordering::Acquire) > 0 {
            assert!(std::time::Instant::now() < deadline, "job never completed");
            std::thread::yield_now();
        }
        pool.shutdown();
    }
}
