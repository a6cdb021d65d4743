//! Scheduler contract.
//!
//! A scheduler executes one [`Graph`] on a thread of its own. The worker
//! never calls into a running scheduler directly; everything goes through the
//! [`SchedulerPorts`] handed over at instantiation.

use crate::engine::graph::Graph;
use crate::engine::message::SchedulerPorts;
use crate::error::Result;

/// A graph bound to an execution engine, ready to run
pub trait Scheduler: Send {
    /// Name used to address lifecycle requests to this scheduler
    fn unique_name(&self) -> &str;

    /// Run until a stop is requested through the message ports
    fn run_and_wait(self: Box<Self>);
}

/// Creates schedulers for graphs.
///
/// Instantiation may fail (e.g. a block type the engine does not know); the
/// error is reported and the graph is not started.
pub trait SchedulerFactory: Send + Sync {
    fn instantiate(&self, graph: Graph, ports: SchedulerPorts) -> Result<Box<dyn Scheduler>>;
}
