//! Runtime configuration.
//!
//! The only knobs the core consumes: scheduler sizing, the per-resume
//! throughput budget, the flow-control constants, and the default handler
//! functions installed into every new actor.

use crate::behavior::Reply;
use crate::error::Error;
use crate::message::Message;
use crate::scope::Scope;

/// Signature of a default handler for unmatched ordinary messages.
pub type DefaultHandlerFn = fn(&mut Scope<'_>, &mut Message) -> Reply;

/// Log the unexpected message, then answer [`Error::UnexpectedMessage`].
/// This is the stock default handler.
pub fn print_and_drop(scope: &mut Scope<'_>, msg: &mut Message) -> Reply {
    tracing::warn!(
        id = scope.id(),
        name = scope.name(),
        payload = msg.payload_type(),
        "unexpected message"
    );
    Reply::Error(Error::UnexpectedMessage)
}

/// Silently answer [`Error::UnexpectedMessage`].
pub fn drop_unexpected(_scope: &mut Scope<'_>, _msg: &mut Message) -> Reply {
    Reply::Error(Error::UnexpectedMessage)
}

/// Send the message straight back to the sender.
pub fn reflect(_scope: &mut Scope<'_>, msg: &mut Message) -> Reply {
    Reply::Value(msg.take_message())
}

/// Send the message back to the sender, then quit.
pub fn reflect_and_quit(scope: &mut Scope<'_>, msg: &mut Message) -> Reply {
    scope.quit(crate::error::ExitReason::Normal);
    Reply::Value(msg.take_message())
}

/// Configuration consumed by [`ActorSystem::new`](crate::ActorSystem::new).
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Worker threads in the cooperative pool. `0` means one per
    /// available CPU core (capped at [`MAX_WORKERS`]).
    pub scheduler_max_threads: usize,
    /// Envelopes a scheduled actor may process per `resume` step.
    pub scheduler_max_throughput: usize,
    /// Total credit a sink distributes across its stream sources.
    pub max_credit: u64,
    /// In-flight threshold at or below which a sink replenishes credit.
    pub low_watermark: u64,
    /// Handler installed for unmatched ordinary messages.
    pub default_handler: DefaultHandlerFn,
}

/// Hard cap on pool size.
pub const MAX_WORKERS: usize = 256;

/// Default per-resume throughput budget.
pub const DEFAULT_MAX_THROUGHPUT: usize = 300;

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            scheduler_max_threads: 0,
            scheduler_max_throughput: DEFAULT_MAX_THROUGHPUT,
            max_credit: 50,
            low_watermark: 10,
            default_handler: print_and_drop,
        }
    }
}

impl RuntimeConfig {
    pub fn with_threads(mut self, n: usize) -> Self {
        self.scheduler_max_threads = n;
        self
    }

    pub fn with_max_throughput(mut self, n: usize) -> Self {
        self.scheduler_max_throughput = n.max(1);
        self
    }

    pub fn with_credit(mut self, max_credit: u64, low_watermark: u64) -> Self {
        self.max_credit = max_credit;
        self.low_watermark = low_watermark;
        self
    }

    pub fn with_default_handler(mut self, f: DefaultHandlerFn) -> Self {
        self.default_handler = f;
        self
    }

    /// Resolve the worker count: explicit setting, else one per core.
    pub(crate) fn resolved_threads(&self) -> usize {
        let n = if self.scheduler_max_threads > 0 {
            self.scheduler_max_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        };
        n.clamp(1, MAX_WORKERS)
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("scheduler_max_threads", &self.scheduler_max_threads)
            .field("scheduler_max_throughput", &self.scheduler_max_throughput)
            .field("max_credit", &self.max_credit)
            .field("low_watermark", &self.low_watermark)
            .finish_non_exhaustive()
    }
}
