//! The actor system: owns the worker pool, the clock, the registry, and
//! the local groups, and is the only place actors are born.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::actor::{ActorCell, ActorRef};
use crate::behavior::Behavior;
use crate::blocking::{self, BlockingScope};
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::detached::PrivateThread;
use crate::group::LocalGroup;
use crate::registry::Registry;
use crate::scheduler::{SchedMetrics, WorkerPool};
use crate::scope::Scope;

/// Spawn-time options.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Actor name for logging and the info request; defaults to "actor".
    pub name: Option<String>,
    /// Run on a dedicated thread instead of the worker pool.
    pub detached: bool,
    /// Partition the mailbox by the high-priority bit at dequeue time.
    pub priority_aware: bool,
    /// Do not schedule until the first message arrives.
    pub lazy: bool,
    /// Keep the actor out of the registry.
    pub hidden: bool,
    /// Link the spawner to the child (only meaningful via
    /// [`Scope::spawn_opts`]).
    pub link: bool,
    /// Let the spawner monitor the child (only meaningful via
    /// [`Scope::spawn_opts`]).
    pub monitor: bool,
}

impl SpawnOptions {
    pub fn named(name: impl Into<String>) -> SpawnOptions {
        SpawnOptions {
            name: Some(name.into()),
            ..SpawnOptions::default()
        }
    }

    pub fn detached(mut self) -> SpawnOptions {
        self.detached = true;
        self
    }

    pub fn priority_aware(mut self) -> SpawnOptions {
        self.priority_aware = true;
        self
    }

    pub fn lazy(mut self) -> SpawnOptions {
        self.lazy = true;
        self
    }

    pub fn hidden(mut self) -> SpawnOptions {
        self.hidden = true;
        self
    }

    pub fn linked(mut self) -> SpawnOptions {
        self.link = true;
        self
    }

    pub fn monitored(mut self) -> SpawnOptions {
        self.monitor = true;
        self
    }
}

pub(crate) struct SystemCore {
    config: RuntimeConfig,
    pool: WorkerPool,
    clock: Clock,
    registry: Registry,
    groups: Mutex<HashMap<String, Arc<LocalGroup>>>,
    next_actor_id: AtomicU64,
}

impl SystemCore {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn next_id(&self) -> u64 {
        self.next_actor_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Cheap-clone handle on the running system.
#[derive(Clone)]
pub struct ActorSystem {
    core: Arc<SystemCore>,
}

impl ActorSystem {
    /// Start the worker pool and the clock.
    pub fn new(config: RuntimeConfig) -> ActorSystem {
        let threads = config.resolved_threads();
        let pool = WorkerPool::start(threads, config.scheduler_max_throughput);
        let clock = Clock::start();
        tracing::debug!(threads, "actor system up");
        ActorSystem {
            core: Arc::new(SystemCore {
                config,
                pool,
                clock,
                registry: Registry::new(),
                groups: Mutex::new(HashMap::new()),
                next_actor_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SystemCore>) -> ActorSystem {
        ActorSystem { core }
    }

    /// Spawn an event-based actor with default options. `init` runs on
    /// first scheduling and returns the initial behavior.
    pub fn spawn<F>(&self, init: F) -> ActorRef
    where
        F: FnOnce(&mut Scope<'_>) -> Behavior + Send + 'static,
    {
        self.spawn_opts(SpawnOptions::default(), init)
    }

    /// Spawn an event-based actor.
    pub fn spawn_opts<F>(&self, opts: SpawnOptions, init: F) -> ActorRef
    where
        F: FnOnce(&mut Scope<'_>) -> Behavior + Send + 'static,
    {
        let id = self.core.next_id();
        let name = opts.name.unwrap_or_else(|| "actor".to_string());
        let core = Arc::clone(&self.core);
        let cell: ActorRef = Arc::new_cyclic(|weak| {
            ActorCell::new(core, id, name, Some(Box::new(init)), weak.clone())
        });
        cell.set_priority_aware(opts.priority_aware);
        self.core.registry.inc_running();
        if !opts.hidden {
            cell.set_registered(true);
            self.core.registry.put(id, Arc::clone(&cell));
        }
        if opts.detached {
            cell.set_detached(true);
            let pt = PrivateThread::new();
            {
                let mut slot = cell.private_thread.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(Arc::clone(&pt));
            }
            pt.start(Arc::clone(&cell));
        } else {
            cell.launch(opts.lazy);
        }
        cell
    }

    /// Spawn a blocking actor: `body` runs to completion on a dedicated
    /// thread, then the actor cleans up with its recorded exit reason.
    pub fn spawn_blocking<F>(&self, body: F) -> ActorRef
    where
        F: FnOnce(&mut BlockingScope<'_>) + Send + 'static,
    {
        self.spawn_blocking_opts(SpawnOptions::default(), body)
    }

    pub fn spawn_blocking_opts<F>(&self, opts: SpawnOptions, body: F) -> ActorRef
    where
        F: FnOnce(&mut BlockingScope<'_>) + Send + 'static,
    {
        let id = self.core.next_id();
        let name = opts.name.unwrap_or_else(|| "actor".to_string());
        let core = Arc::clone(&self.core);
        let cell: ActorRef =
            Arc::new_cyclic(|weak| ActorCell::new(core, id, name, None, weak.clone()));
        cell.set_detached(true);
        cell.set_blocking(true);
        cell.set_priority_aware(opts.priority_aware);
        self.core.registry.inc_running();
        if !opts.hidden {
            cell.set_registered(true);
            self.core.registry.put(id, Arc::clone(&cell));
        }
        let job = Arc::clone(&cell);
        let spawned = std::thread::Builder::new()
            .name(format!("rookery-blocking-{id}"))
            .spawn(move || blocking::run_blocking(job, Box::new(body)));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn blocking actor thread");
        }
        cell
    }

    /// Get or create the local group `name`.
    pub fn group(&self, name: &str) -> Arc<LocalGroup> {
        let mut groups = self.core.groups.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            groups
                .entry(name.to_string())
                .or_insert_with(|| LocalGroup::new(name)),
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    pub fn metrics(&self) -> SchedMetrics {
        self.core.pool.metrics()
    }

    /// Block until every spawned actor has cleaned up.
    pub fn await_all_actors_done(&self) {
        self.core.registry.await_running_count_le(0);
    }

    /// Stop the clock and join the worker pool. Actors still queued stop
    /// making progress; call [`await_all_actors_done`] first for a clean
    /// drain.
    ///
    /// [`await_all_actors_done`]: ActorSystem::await_all_actors_done
    pub fn shutdown(&self) {
        self.core.clock.shutdown();
        self.core.pool.shutdown();
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("running", &self.core.registry.running_count())
            .finish_non_exhaustive()
    }
}
