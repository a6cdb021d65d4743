//! Execution engine contract
//!
//! The worker treats the processing graph and its scheduler as an external
//! collaborator. This module defines the narrow surface it relies on:
//!
//! - [`property`] - loosely typed settings, tag payloads and strict lookups
//! - [`message`] - lifecycle and settings messages plus the channel pair
//! - [`graph`] - block list, sink classification and the description parser
//! - [`scheduler`] - the [`Scheduler`] / [`SchedulerFactory`] traits
//! - [`sim`] - a simulated engine producing synthetic signals (feature `sim-engine`)

pub mod graph;
pub mod message;
pub mod property;
pub mod scheduler;
#[cfg(feature = "sim-engine")]
pub mod sim;

pub use graph::{BlockDescriptor, Graph, SinkKind};
pub use message::{Command, LifecycleState, Message, MessagePorts, SchedulerPorts, WorkerPorts};
pub use property::{PropertyMap, PropertyValue, Tag};
pub use scheduler::{Scheduler, SchedulerFactory};
#[cfg(feature = "sim-engine")]
pub use sim::SimEngine;
