//! Graph lifecycle loop
//!
//! [`LifecycleLoop`] is owned by the worker thread. It is the only owner of
//! the running scheduler, the tap caches and the signal metadata, so none of
//! them need locking. Each call to [`LifecycleLoop::iterate`] runs one cycle:
//!
//! 1. apply commands and take the pending replacement graph
//! 2. ask a running scheduler to stop on shutdown or replacement
//! 3. drain scheduler notifications
//! 4. reconcile subscriptions while a scheduler runs, repeating until taps
//!    are idle while stopping
//! 5. tear the scheduler down once stopping or finished
//! 6. exit on shutdown
//! 7. install the replacement graph
//! 8. sleep until the next tick

use super::{WorkerCommand, WorkerShared};
use crate::broker::{ReplyPublisher, SubscriptionSource};
use crate::config::WorkerConfig;
use crate::engine::message::{
    Command, LifecycleState, Message, MessagePorts, WorkerPorts, LIFECYCLE_STATE_ENDPOINT,
    SETTINGS_ENDPOINT, STATE_KEY,
};
use crate::engine::property::lookup_or_log;
use crate::engine::{Graph, SchedulerFactory};
use crate::taps::TapRegistry;
use crate::worker::reconciler::{PassOutcome, SubscriptionReconciler};
use crate::worker::signals::{SignalEntryObserver, SignalMetadataTracker};
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Client id used when subscribing to scheduler notifications
pub const CLIENT_ID: &str = "sigtap";

/// Whether the worker thread should keep iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

/// A scheduler started from an installed graph
struct RunningGraph {
    unique_name: String,
    ports: WorkerPorts,
    thread: JoinHandle<()>,
}

impl RunningGraph {
    fn request_stop(&self) {
        let request = Message::lifecycle_request(&self.unique_name, LifecycleState::RequestedStop);
        if let Err(e) = self.ports.send(request) {
            tracing::warn!("Could not ask scheduler {} to stop: {}", self.unique_name, e);
        }
    }
}

/// State owned by the worker thread
pub struct LifecycleLoop {
    config: WorkerConfig,
    engine: Arc<dyn SchedulerFactory>,
    subscriptions: Arc<dyn SubscriptionSource>,
    publisher: Arc<dyn ReplyPublisher>,
    commands: Receiver<WorkerCommand>,
    shared: Arc<WorkerShared>,
    reconciler: SubscriptionReconciler,
    tracker: SignalMetadataTracker,
    observer: Option<Box<dyn SignalEntryObserver>>,
    running: Option<RunningGraph>,
    /// Scheduled start of the current cycle
    tick: Instant,
}

impl LifecycleLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: WorkerConfig,
        registry: Arc<dyn TapRegistry>,
        engine: Arc<dyn SchedulerFactory>,
        subscriptions: Arc<dyn SubscriptionSource>,
        publisher: Arc<dyn ReplyPublisher>,
        observer: Option<Box<dyn SignalEntryObserver>>,
        commands: Receiver<WorkerCommand>,
        shared: Arc<WorkerShared>,
    ) -> Self {
        Self {
            config,
            engine,
            subscriptions,
            publisher,
            commands,
            shared,
            reconciler: SubscriptionReconciler::new(registry),
            tracker: SignalMetadataTracker::new(),
            observer,
            running: None,
            tick: Instant::now(),
        }
    }

    /// Iterate until shutdown
    pub fn run(&mut self) {
        tracing::info!("Acquisition worker started");
        while self.iterate() == LoopControl::Continue {}
        tracing::info!("Acquisition worker stopped");
    }

    /// Run one cycle
    pub fn iterate(&mut self) -> LoopControl {
        self.process_commands();

        let pending = self.shared.take_pending_graph();
        let shutdown = self.shared.shutdown_requested();

        let mut stop_requested = false;
        if let Some(running) = &self.running {
            if shutdown || pending.is_some() {
                tracing::info!("Stopping scheduler {}", running.unique_name);
                running.request_stop();
                stop_requested = true;
            }
        }

        let finished = self.drain_notifications();

        // taps only exist while a scheduler runs
        let outcome = if self.running.is_none() {
            PassOutcome::default()
        } else if stop_requested {
            let deadline = Instant::now() + self.config.teardown_timeout();
            self.reconciler.reconcile_until_idle(
                self.subscriptions.as_ref(),
                self.publisher.as_ref(),
                deadline,
            )
        } else {
            let subscriptions = self.subscriptions.active_subscriptions();
            self.reconciler
                .reconcile_pass(&subscriptions, self.publisher.as_ref())
        };
        self.record(&outcome);

        if stop_requested || finished {
            self.teardown();
        }

        if shutdown {
            return LoopControl::Exit;
        }

        if let Some(graph) = pending {
            self.install(graph);
        }

        self.rate_limit();
        LoopControl::Continue
    }

    /// Apply commands from the handle
    fn process_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::SetSignalObserver(observer)) => {
                    self.observer = Some(observer);
                    if self.running.is_some() {
                        self.tracker.publish(self.observer.as_deref());
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // handle is gone
                    self.shared.request_shutdown();
                    break;
                }
            }
        }
    }

    /// Handle buffered scheduler notifications; returns whether the scheduler
    /// has finished
    fn drain_notifications(&mut self) -> bool {
        let Some(running) = &self.running else {
            return false;
        };

        let mut finished = false;
        for message in running.ports.drain() {
            if message.command != Command::Notify {
                continue;
            }
            match message.endpoint.as_str() {
                LIFECYCLE_STATE_ENDPOINT => {
                    let state = message
                        .data
                        .as_ref()
                        .and_then(|data| lookup_or_log::<String>(data, STATE_KEY))
                        .and_then(|state| match state.parse::<LifecycleState>() {
                            Ok(state) => Some(state),
                            Err(e) => {
                                tracing::warn!("{}", e);
                                None
                            }
                        });
                    match state {
                        Some(LifecycleState::Stopped) => {
                            tracing::info!("Scheduler {} stopped", running.unique_name);
                            finished = true;
                        }
                        Some(LifecycleState::Error) => {
                            tracing::warn!("Scheduler {} reported an error", running.unique_name);
                        }
                        Some(state) => {
                            tracing::debug!("Scheduler {} is {}", running.unique_name, state)
                        }
                        None => {}
                    }
                }
                SETTINGS_ENDPOINT => {
                    if let Some(settings) = &message.data {
                        self.tracker
                            .apply_setting_update(&message.service_name, settings);
                    }
                }
                other => tracing::trace!("Ignoring notification on '{}'", other),
            }
        }

        if !finished && running.thread.is_finished() {
            tracing::warn!("Scheduler {} exited without stopping", running.unique_name);
            finished = true;
        }

        if self.tracker.is_dirty() {
            self.tracker.publish(self.observer.as_deref());
        }
        finished
    }

    /// Drop all state of the running graph and join its scheduler
    fn teardown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.tracker.clear();
        self.tracker.publish(self.observer.as_deref());
        self.reconciler.clear();
        self.shared.streaming_taps.store(0, Ordering::Relaxed);
        self.shared.dataset_taps.store(0, Ordering::Relaxed);
        self.shared.graph_running.store(false, Ordering::SeqCst);

        let RunningGraph {
            unique_name,
            ports,
            thread,
        } = running;
        drop(ports);
        if thread.join().is_err() {
            tracing::error!("Scheduler {} panicked", unique_name);
        } else {
            tracing::info!("Scheduler {} joined", unique_name);
        }
    }

    /// Start a scheduler for `graph`
    fn install(&mut self, graph: Graph) {
        let (scheduler_ports, worker_ports) = MessagePorts::connect();
        self.tracker.seed_from_graph(&graph);

        let scheduler = match self.engine.instantiate(graph, scheduler_ports) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                tracing::error!("Could not instantiate scheduler: {}", e);
                self.tracker.clear();
                return;
            }
        };
        let unique_name = scheduler.unique_name().to_string();

        for request in [
            Message::new(Command::Subscribe, unique_name.as_str(), LIFECYCLE_STATE_ENDPOINT)
                .with_client(CLIENT_ID),
            Message::new(Command::Subscribe, "", SETTINGS_ENDPOINT).with_client(CLIENT_ID),
        ] {
            if let Err(e) = worker_ports.send(request) {
                tracing::warn!("Could not subscribe to {}: {}", unique_name, e);
            }
        }

        let thread = match std::thread::Builder::new()
            .name(format!("sigtap-{}", unique_name))
            .spawn(move || scheduler.run_and_wait())
        {
            Ok(thread) => thread,
            Err(e) => {
                tracing::error!("Could not start scheduler {}: {}", unique_name, e);
                self.tracker.clear();
                return;
            }
        };

        self.tracker.publish(self.observer.as_deref());
        tracing::info!(
            "Installed graph on scheduler {} ({} sinks)",
            unique_name,
            self.tracker.sink_count()
        );
        self.shared.graphs_installed.fetch_add(1, Ordering::Relaxed);
        self.shared.graph_running.store(true, Ordering::SeqCst);
        self.running = Some(RunningGraph {
            unique_name,
            ports: worker_ports,
            thread,
        });
    }

    fn record(&self, outcome: &PassOutcome) {
        let shared = &self.shared;
        shared.cycles.fetch_add(1, Ordering::Relaxed);
        shared.replies.fetch_add(outcome.replies as u64, Ordering::Relaxed);
        shared
            .skipped_subscriptions
            .fetch_add(outcome.skipped_subscriptions as u64, Ordering::Relaxed);
        shared
            .streaming_taps
            .store(self.reconciler.streaming_taps(), Ordering::Relaxed);
        shared
            .dataset_taps
            .store(self.reconciler.dataset_taps(), Ordering::Relaxed);
    }

    /// Rate limit the loop to the configured update period
    fn rate_limit(&mut self) {
        let now = Instant::now();
        self.tick = next_tick(self.tick, self.config.update_period(), now);

        if self.tick > now {
            std::thread::sleep(self.tick - now);
        }
    }
}

/// Next tick on the `period` grid after `tick`. An overrun cycle restarts
/// the grid at `now` instead of running the missed ticks back to back.
fn next_tick(tick: Instant, period: Duration, now: Instant) -> Instant {
    let next = tick + period;
    if next < now {
        now
    } else {
        next
    }
}
