//! Cooperatively scheduled local actor runtime.
//!
//! Every actor owns a mailbox and runs its message handlers one at a time,
//! either on a shared work-stealing worker pool or (on request) on a
//! dedicated thread. The core coordinates pending requests and responses,
//! idle timeouts, group subscriptions, linked and monitored peers, and
//! credit-based flow control between cooperating actors.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: error, message, envelope, config   (no internal deps)
//! Layer 1: mailbox, behavior                  (envelope + atomics)
//! Layer 2: actor, dispatch, flow, scope       (the control block)
//! Layer 3: scheduler, clock, detached, blocking
//! Layer 4: registry, group, link, monitor, system
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rookery::{ActorSystem, Behavior, Reply, RuntimeConfig, Scope};
//!
//! #[derive(Clone)]
//! struct Ping;
//!
//! let system = ActorSystem::new(RuntimeConfig::default());
//! let echo = system.spawn(|_scope: &mut Scope<'_>| {
//!     Behavior::new()
//!         .on::<Ping, _>(|scope: &mut Scope<'_>, _msg: &mut Ping| {
//!             scope.quit(rookery::ExitReason::Normal);
//!             Reply::with("pong")
//!         })
//!         .build()
//! });
//! rookery::anon_send(&echo, Ping);
//! system.await_all_actors_done();
//! system.shutdown();
//! ```

mod actor;
mod behavior;
mod blocking;
mod clock;
mod config;
mod detached;
mod dispatch;
mod envelope;
mod error;
mod flow;
mod group;
mod link;
mod mailbox;
mod message;
mod monitor;
mod registry;
mod scheduler;
mod scope;
mod system;

pub use actor::{anon_send, ActorAddr, ActorCell, ActorId, ActorRef};
pub use behavior::{Behavior, BehaviorBuilder, Reply};
pub use blocking::BlockingScope;
pub use clock::Clock;
pub use config::{
    drop_unexpected, print_and_drop, reflect, reflect_and_quit, DefaultHandlerFn, RuntimeConfig,
    DEFAULT_MAX_THROUGHPUT, MAX_WORKERS,
};
pub use envelope::{Envelope, MessageId};
pub use error::{Error, ExitReason};
pub use flow::StreamHandle;
pub use group::{Group, LocalGroup};
pub use link::send_exit;
pub use mailbox::{EnqueueResult, Mailbox};
pub use message::{
    ActorInfo, AddSource, CreditGrant, DelSource, DownMsg, ExitMsg, Message, SysRequest,
    TimeoutMsg,
};
pub use registry::Registry;
pub use scheduler::{Resumable, ResumeResult, SchedMetrics, WorkerPool};
pub use scope::{ResponsePromise, Scope};
pub use system::{ActorSystem, SpawnOptions};
