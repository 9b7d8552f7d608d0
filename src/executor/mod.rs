//! Executor façade (C3, spec §4.3) and the small capability set described in
//! §9 ("dynamic dispatch over executor/provider/launcher"): concrete structs
//! implementing narrow traits, no deep hierarchy.

mod mock;
mod process;

pub use mock::MockExecutor;
pub use process::{DirectLauncher, LocalProvider, ProcessPoolExecutor};

use crate::message::ResultEnvelope;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Read-only view of load, handed to the scaling strategy so that the cycle
/// between Interchange and Executor described in §9 is broken: the strategy
/// never holds a reference to the whole core, only this.
#[derive(Debug, Clone, Copy)]
pub struct LoadView {
    pub outstanding: usize,
    pub idle_for: Duration,
}

/// Uniform submit/results interface over whatever actually runs the work
/// (bare processes, containers, a cluster provider wrapper).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Non-blocking handoff; the façade queues internally if all workers are
    /// busy. Never fails by dropping the submission — at worst a result with
    /// `ResultKind::WorkerFailed` is produced later.
    async fn submit(&self, task_id: Uuid, task_buffer: Vec<u8>, routing_key: String);

    /// Pulls the next completed result in completion order. Returns `None`
    /// only once the façade has been shut down and drained.
    async fn next_result(&self) -> Option<ResultEnvelope>;

    /// Count of in-flight tasks, used by the scaling strategy (C4).
    fn outstanding(&self) -> usize;

    fn load_view(&self) -> LoadView;

    /// `drain = true` blocks until in-flight tasks have produced results;
    /// `drain = false` cancels pending work.
    async fn shutdown(&self, drain: bool);
}

/// A unit of compute capacity a [`Provider`] can allocate or release. The
/// core never inspects its internals (spec §3, Worker-block descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

/// Scales the pool of worker blocks behind an [`Executor`].
#[async_trait]
pub trait Provider: Send + Sync {
    async fn scale_out(&self, n: usize);
    async fn scale_in(&self, n: usize);
    fn status(&self) -> usize;
}

/// Wraps the configured worker command before it is executed. The shipped
/// `DirectLauncher` is the identity wrap; a container or cluster-scheduler
/// launcher would implement this trait instead (out of scope here, per
/// spec §1).
pub trait Launcher: Send + Sync {
    fn wrap_command(&self, command: &[String]) -> Vec<String>;
}
