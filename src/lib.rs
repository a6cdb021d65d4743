//! # sigtap: Acquisition Worker with Demand-Driven Signal Taps
//!
//! sigtap connects subscribers to the sinks of a running processing graph.
//! Subscribers describe what they want with a [`TimeDomainFilter`]
//! (acquisition mode, channels, window parameters); the worker creates taps
//! on the matching sinks only while someone asks for them and turns every
//! drained batch or dataset into an [`Acquisition`] reply.
//!
//! ## Architecture
//!
//! - **Engine**: graph model, message protocol and the scheduler contract,
//!   with a simulated engine for running without real hardware
//! - **Taps**: the tap contract and an in-process sink registry
//! - **Broker**: subscription source and reply publisher, with an in-process
//!   broker
//! - **Worker**: a single thread that installs graphs, reconciles
//!   subscriptions against cached taps and tracks signal metadata
//! - **Flow graph**: stores the graph description and forwards valid ones to
//!   the worker
//!
//! ## Example
//!
//! ```ignore
//! use sigtap::{
//!     AcqConfig, AcquisitionWorker, FlowGraphService, LocalBroker, SimEngine, SinkRegistry,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> sigtap::Result<()> {
//!     let config = AcqConfig::default();
//!     let registry = SinkRegistry::new(config.taps.clone());
//!     let broker = LocalBroker::new(&config.broker);
//!
//!     let worker = AcquisitionWorker::builder(config.worker.clone())
//!         .registry(Arc::new(registry.clone()))
//!         .engine(Arc::new(SimEngine::new(registry, config.simulation.clone())))
//!         .broker(broker.clone())
//!         .spawn()?;
//!     let flowgraph = FlowGraphService::new(worker);
//!     flowgraph.load_file("graph.toml")?;
//!
//!     let subscription = broker.subscribe_query("acquisitionModeFilter=continuous&channelNameFilter=A")?;
//!     while let Some(reply) = subscription.recv_timeout(std::time::Duration::from_secs(1)) {
//!         println!("{} samples of {}", reply.channel_value.len(), reply.channel_name);
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod flowgraph;
pub mod taps;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use broker::{LocalBroker, ReplyPublisher, Subscription, SubscriptionHandle, SubscriptionSource};
pub use config::AcqConfig;
pub use engine::{BlockDescriptor, Graph, SchedulerFactory};
#[cfg(feature = "sim-engine")]
pub use engine::SimEngine;
pub use error::{AcqError, Result};
pub use flowgraph::{FlowGraphService, GraphSink};
pub use taps::{SinkRegistry, TapRegistry};
pub use types::{Acquisition, AcquisitionMode, SignalEntry, SubscriptionKey, TimeDomainFilter};
pub use worker::{AcquisitionWorker, SignalEntryObserver, WorkerStats};
