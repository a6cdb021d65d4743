//! A complete in-process service on the simulated engine

use super::wait_for;
use sigtap::config::AcqConfig;
use sigtap::{
    Acquisition, AcquisitionWorker, FlowGraphService, LocalBroker, SignalEntry, SimEngine,
    SinkRegistry, SubscriptionHandle,
};
use std::sync::{Arc, Mutex};

/// Config with short periods so tests run quickly
pub fn fast_config() -> AcqConfig {
    let mut config = AcqConfig::default();
    config.worker.update_period_ms = 5;
    config.worker.teardown_timeout_ms = 2_000;
    config.simulation.tick_ms = 5;
    config.simulation.block_size = 64;
    config.taps.default_sample_rate = 1_000.0;
    config
}

/// Worker, broker, registry and flow-graph service wired together
pub struct TestService {
    pub registry: SinkRegistry,
    pub broker: LocalBroker,
    pub flowgraph: FlowGraphService<Arc<AcquisitionWorker>>,
    pub worker: Arc<AcquisitionWorker>,
    signal_updates: Arc<Mutex<Vec<Vec<SignalEntry>>>>,
}

impl TestService {
    pub fn start() -> Self {
        Self::start_with(fast_config())
    }

    pub fn start_with(config: AcqConfig) -> Self {
        let registry = SinkRegistry::new(config.taps.clone());
        let broker = LocalBroker::new(&config.broker);
        let engine = SimEngine::new(registry.clone(), config.simulation.clone())
            .with_default_sample_rate(config.taps.default_sample_rate);

        let signal_updates = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::clone(&signal_updates);
        let worker = AcquisitionWorker::builder(config.worker.clone())
            .registry(Arc::new(registry.clone()))
            .engine(Arc::new(engine))
            .broker(broker.clone())
            .signal_observer(move |entries: &[SignalEntry]| {
                updates.lock().unwrap().push(entries.to_vec());
            })
            .spawn()
            .expect("worker should start");
        let worker = Arc::new(worker);

        Self {
            registry,
            broker,
            flowgraph: FlowGraphService::new(Arc::clone(&worker)),
            worker,
            signal_updates,
        }
    }

    /// Every list the signal observer received so far
    pub fn signal_updates(&self) -> Vec<Vec<SignalEntry>> {
        self.signal_updates.lock().unwrap().clone()
    }

    /// Wait until the observer saw `count` lists
    pub fn wait_for_signal_updates(&self, count: usize) -> Vec<Vec<SignalEntry>> {
        assert!(
            wait_for(|| self.signal_updates.lock().unwrap().len() >= count),
            "expected {} signal updates, got {:?}",
            count,
            self.signal_updates()
        );
        self.signal_updates()
    }

    /// Wait until the registry holds `count` sinks
    pub fn wait_for_sinks(&self, count: usize) {
        assert!(
            wait_for(|| self.registry.sink_count() == count),
            "expected {} sinks, registry has {}",
            count,
            self.registry.sink_count()
        );
    }
}

/// Collect replies until `count` arrived or the test timeout expires
pub fn collect_replies(handle: &SubscriptionHandle, count: usize) -> Vec<Acquisition> {
    let mut replies = Vec::new();
    wait_for(|| {
        replies.extend(handle.drain());
        replies.len() >= count
    });
    replies
}
