//! Acquisition worker
//!
//! The worker multiplexes the filtered subscriptions of a broker onto taps of
//! the running processing graph and hands one reply per drained unit back to
//! the broker. It runs on one dedicated thread for the lifetime of the
//! service and is controlled through [`AcquisitionWorker`].
//!
//! # Components
//!
//! - [`trigger`] - trigger name matching for windowed taps
//! - [`cache`] - mark-and-sweep cache of taps keyed by subscription key
//! - [`reply`] - conversion of drained data into replies
//! - [`reconciler`] - one reconciliation pass over all subscriptions
//! - [`signals`] - per-sink signal metadata and its observer
//! - [`lifecycle`] - the loop run by the worker thread
//!
//! # Example
//!
//! ```ignore
//! use sigtap::{AcqConfig, AcquisitionWorker, LocalBroker, SimEngine, SinkRegistry};
//! use std::sync::Arc;
//!
//! let config = AcqConfig::default();
//! let registry = SinkRegistry::new(config.taps.clone());
//! let broker = LocalBroker::new(&config.broker);
//! let worker = AcquisitionWorker::builder(config.worker.clone())
//!     .registry(Arc::new(registry.clone()))
//!     .engine(Arc::new(SimEngine::new(registry, config.simulation.clone())))
//!     .broker(broker.clone())
//!     .spawn()?;
//! ```

pub mod cache;
pub mod lifecycle;
pub mod reconciler;
pub mod reply;
pub mod signals;
pub mod trigger;

pub use cache::{PollerCache, StreamingMetadata};
pub use lifecycle::{LifecycleLoop, LoopControl};
pub use reconciler::{PassOutcome, SubscriptionReconciler};
pub use signals::{SignalEntryObserver, SignalMetadataTracker};
pub use trigger::TriggerNameMatcher;

use crate::broker::{ReplyPublisher, SubscriptionSource};
use crate::config::WorkerConfig;
use crate::engine::{Graph, SchedulerFactory};
use crate::error::{AcqError, Result};
use crate::taps::TapRegistry;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Commands applied by the worker thread
pub enum WorkerCommand {
    /// Replace the signal entry observer
    SetSignalObserver(Box<dyn SignalEntryObserver>),
}

/// State shared between the handle and the worker thread
#[derive(Default)]
pub struct WorkerShared {
    pending_graph: Mutex<Option<Graph>>,
    shutdown: AtomicBool,
    pub(crate) cycles: AtomicU64,
    pub(crate) replies: AtomicU64,
    pub(crate) skipped_subscriptions: AtomicU64,
    pub(crate) graphs_installed: AtomicU64,
    pub(crate) streaming_taps: AtomicUsize,
    pub(crate) dataset_taps: AtomicUsize,
    pub(crate) graph_running: AtomicBool,
}

impl WorkerShared {
    /// Store `graph` as the pending replacement, overwriting any previous one
    pub fn set_pending_graph(&self, graph: Graph) {
        if lock(&self.pending_graph).replace(graph).is_some() {
            tracing::debug!("Pending graph replaced before it was applied");
        }
    }

    pub fn take_pending_graph(&self) -> Option<Graph> {
        lock(&self.pending_graph).take()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            skipped_subscriptions: self.skipped_subscriptions.load(Ordering::Relaxed),
            graphs_installed: self.graphs_installed.load(Ordering::Relaxed),
            streaming_taps: self.streaming_taps.load(Ordering::Relaxed),
            dataset_taps: self.dataset_taps.load(Ordering::Relaxed),
            graph_running: self.graph_running.load(Ordering::SeqCst),
        }
    }
}

/// Snapshot of worker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Completed loop cycles
    pub cycles: u64,
    /// Replies handed to the publisher
    pub replies: u64,
    /// Subscriptions skipped because they could not be interpreted
    pub skipped_subscriptions: u64,
    /// Graphs that reached a running scheduler
    pub graphs_installed: u64,
    /// Cached continuous taps after the last cycle
    pub streaming_taps: usize,
    /// Cached windowed and dataset taps after the last cycle
    pub dataset_taps: usize,
    /// Whether a scheduler is currently running
    pub graph_running: bool,
}

// ==================== Builder ====================

/// Collects the collaborators of an [`AcquisitionWorker`]
pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: Option<Arc<dyn TapRegistry>>,
    engine: Option<Arc<dyn SchedulerFactory>>,
    subscriptions: Option<Arc<dyn SubscriptionSource>>,
    publisher: Option<Arc<dyn ReplyPublisher>>,
    observer: Option<Box<dyn SignalEntryObserver>>,
}

impl WorkerBuilder {
    pub fn registry(mut self, registry: Arc<dyn TapRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn SchedulerFactory>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use `broker` as both subscription source and reply publisher
    pub fn broker<B>(mut self, broker: B) -> Self
    where
        B: SubscriptionSource + ReplyPublisher + Clone + 'static,
    {
        self.subscriptions = Some(Arc::new(broker.clone()));
        self.publisher = Some(Arc::new(broker));
        self
    }

    pub fn subscriptions(mut self, source: Arc<dyn SubscriptionSource>) -> Self {
        self.subscriptions = Some(source);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn ReplyPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn signal_observer(mut self, observer: impl SignalEntryObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Start the worker thread
    pub fn spawn(self) -> Result<AcquisitionWorker> {
        let registry = self
            .registry
            .ok_or_else(|| AcqError::Config("worker needs a tap registry".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| AcqError::Config("worker needs a scheduler factory".to_string()))?;
        let subscriptions = self
            .subscriptions
            .ok_or_else(|| AcqError::Config("worker needs a subscription source".to_string()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| AcqError::Config("worker needs a reply publisher".to_string()))?;

        let (command_tx, command_rx) = bounded(self.config.command_capacity.max(1));
        let shared = Arc::new(WorkerShared::default());

        let mut lifecycle = LifecycleLoop::new(
            self.config,
            registry,
            engine,
            subscriptions,
            publisher,
            self.observer,
            command_rx,
            Arc::clone(&shared),
        );
        let thread = std::thread::Builder::new()
            .name("sigtap-worker".to_string())
            .spawn(move || lifecycle.run())?;

        Ok(AcquisitionWorker {
            shared,
            commands: command_tx,
            thread: Mutex::new(Some(thread)),
        })
    }
}

// ==================== Handle ====================

/// Handle to the acquisition worker thread
///
/// Dropping the handle shuts the worker down and waits for it.
pub struct AcquisitionWorker {
    shared: Arc<WorkerShared>,
    commands: Sender<WorkerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionWorker {
    pub fn builder(config: WorkerConfig) -> WorkerBuilder {
        WorkerBuilder {
            config,
            registry: None,
            engine: None,
            subscriptions: None,
            publisher: None,
            observer: None,
        }
    }

    /// Install `graph` as the pending replacement
    ///
    /// Applied asynchronously on the next cycle. A graph set before the
    /// previous one was applied replaces it.
    pub fn set_graph(&self, graph: Graph) {
        self.shared.set_pending_graph(graph);
    }

    /// Replace the signal entry observer
    ///
    /// If a graph is running the observer receives the current list right
    /// away.
    pub fn set_signal_observer(&self, observer: impl SignalEntryObserver + 'static) -> Result<()> {
        match self
            .commands
            .try_send(WorkerCommand::SetSignalObserver(Box::new(observer)))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(AcqError::Channel("worker command queue full".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AcqError::Channel("worker has stopped".to_string()))
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.snapshot()
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the running graph, drain its taps and join the worker thread
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        if thread.join().is_err() {
            tracing::error!("Acquisition worker thread panicked");
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::engine::graph::BlockDescriptor;
    use crate::taps::SinkRegistry;

    struct NoEngine;

    impl SchedulerFactory for NoEngine {
        fn instantiate(
            &self,
            _graph: Graph,
            _ports: crate::engine::SchedulerPorts,
        ) -> Result<Box<dyn crate::engine::Scheduler>> {
            Err(AcqError::Scheduler("unavailable".to_string()))
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            update_period_ms: 1,
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = AcquisitionWorker::builder(fast_config()).spawn();
        assert!(matches!(result, Err(AcqError::Config(_))));

        let result = AcquisitionWorker::builder(fast_config())
            .registry(Arc::new(SinkRegistry::default()))
            .engine(Arc::new(NoEngine))
            .spawn();
        assert!(matches!(result, Err(AcqError::Config(_))));
    }

    #[test]
    fn test_pending_graph_last_write_wins() {
        let shared = WorkerShared::default();
        shared.set_pending_graph(Graph::new().with_block(BlockDescriptor::new("a", "DataSink<float>")));
        shared.set_pending_graph(Graph::new().with_block(BlockDescriptor::new("b", "DataSink<float>")));
        let graph = shared.take_pending_graph().unwrap();
        assert_eq!(graph.blocks()[0].unique_name, "b");
        assert!(shared.take_pending_graph().is_none());
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let worker = AcquisitionWorker::builder(fast_config())
            .registry(Arc::new(SinkRegistry::default()))
            .engine(Arc::new(NoEngine))
            .broker(LocalBroker::default())
            .spawn()
            .unwrap();
        assert!(worker.is_running());

        worker.set_graph(Graph::new());
        std::thread::sleep(std::time::Duration::from_millis(20));
        let stats = worker.stats();
        assert!(stats.cycles > 0);
        assert!(!stats.graph_running);

        worker.shutdown();
        assert!(!worker.is_running());
        assert!(worker.set_signal_observer(|_: &[crate::types::SignalEntry]| {}).is_err());
        // second shutdown is a no-op
        worker.shutdown();
    }
}
