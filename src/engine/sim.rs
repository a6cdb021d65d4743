//! Simulated execution engine
//!
//! [`SimEngine`] turns a [`Graph`] into a [`SimScheduler`] that produces
//! synthetic waveforms for every sink block of the graph. It implements the
//! full message protocol the worker relies on, which makes it suitable both
//! for the command-line demo and for end-to-end tests.
//!
//! # Block Settings
//!
//! Single-signal sinks (`DataSink...`):
//!
//! | key | type | default |
//! |---|---|---|
//! | `signal_name` | string | block name |
//! | `signal_unit` | string | none |
//! | `sample_rate` | float | `taps.default_sample_rate` |
//! | `waveform` | `sine` / `ramp` / `constant` | `sine` |
//! | `amplitude` | float | 1.0 |
//! | `frequency` | float | 1.0 |
//! | `trigger_interval` | int (samples) | no triggers |
//! | `trigger_name` | string | `TRIGGER` |
//!
//! Multi-signal sinks (`DataSetSink...`) require `signal_names` and accept
//! `signal_units`, `amplitude` and `trigger_name`.

use crate::config::SimulationConfig;
use crate::engine::graph::{BlockDescriptor, Graph, SinkKind};
use crate::engine::message::{
    Command, LifecycleState, Message, SchedulerPorts, LIFECYCLE_STATE_ENDPOINT,
    SETTINGS_ENDPOINT, STATE_KEY,
};
use crate::engine::property::{
    lookup_or_log, PropertyMap, Tag, SAMPLE_RATE, SIGNAL_MAX, SIGNAL_MIN, SIGNAL_NAME,
    SIGNAL_NAMES, SIGNAL_UNIT, SIGNAL_UNITS, TRIGGER_NAME, TRIGGER_TIME,
};
use crate::engine::scheduler::{Scheduler, SchedulerFactory};
use crate::error::{AcqError, Result};
use crate::taps::{DataSet, DataSetSinkHandle, DataSinkHandle, SinkRegistry};
use crossbeam_channel::TryRecvError;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Trigger name used when a block does not configure one
pub const DEFAULT_TRIGGER_NAME: &str = "TRIGGER";

/// Waveform produced by a simulated sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Ramp,
    Constant,
}

impl Waveform {
    fn parse(value: Option<String>) -> Self {
        match value.as_deref() {
            Some("ramp") => Waveform::Ramp,
            Some("constant") => Waveform::Constant,
            Some("sine") | None => Waveform::Sine,
            Some(other) => {
                tracing::warn!("Unknown waveform '{}', using sine", other);
                Waveform::Sine
            }
        }
    }

    fn sample(self, amplitude: f64, frequency: f64, t: f64) -> f64 {
        match self {
            Waveform::Sine => amplitude * (TAU * frequency * t).sin(),
            Waveform::Ramp => amplitude * (frequency * t).fract(),
            Waveform::Constant => amplitude,
        }
    }
}

// ==================== Engine ====================

/// Scheduler factory backed by a [`SinkRegistry`]
pub struct SimEngine {
    registry: SinkRegistry,
    config: SimulationConfig,
    default_sample_rate: f32,
    instances: AtomicU64,
}

impl SimEngine {
    pub fn new(registry: SinkRegistry, config: SimulationConfig) -> Self {
        Self {
            registry,
            config,
            default_sample_rate: 1.0,
            instances: AtomicU64::new(0),
        }
    }

    /// Sample rate assumed for sinks without a `sample_rate` setting
    pub fn with_default_sample_rate(mut self, sample_rate: f32) -> Self {
        self.default_sample_rate = sample_rate;
        self
    }
}

impl SchedulerFactory for SimEngine {
    fn instantiate(&self, graph: Graph, ports: SchedulerPorts) -> Result<Box<dyn Scheduler>> {
        let mut sinks = Vec::new();
        let mut dataset_sinks = Vec::new();

        for (block, kind) in graph.sink_blocks() {
            match kind {
                SinkKind::Single => sinks.push(SimSinkParams::from_block(block, self.default_sample_rate)),
                SinkKind::Multi => dataset_sinks.push(SimDataSetParams::from_block(block)?),
            }
        }

        let n = self.instances.fetch_add(1, Ordering::Relaxed);
        let unique_name = format!("sim_scheduler_{}", n);
        tracing::debug!(
            "Instantiated {} with {} sinks and {} dataset sinks",
            unique_name,
            sinks.len(),
            dataset_sinks.len()
        );

        Ok(Box::new(SimScheduler {
            unique_name,
            ports,
            registry: self.registry.clone(),
            config: self.config.clone(),
            sinks,
            dataset_sinks,
        }))
    }
}

// ==================== Block Parameters ====================

struct SimSinkParams {
    block_name: String,
    settings: PropertyMap,
    default_sample_rate: f32,
}

impl SimSinkParams {
    fn from_block(block: &BlockDescriptor, default_sample_rate: f32) -> Self {
        Self {
            block_name: block.unique_name.clone(),
            settings: block.settings.clone(),
            default_sample_rate,
        }
    }

    fn signal_name(&self) -> String {
        lookup_or_log(&self.settings, SIGNAL_NAME).unwrap_or_else(|| self.block_name.clone())
    }

    fn sample_rate(&self) -> f32 {
        lookup_or_log(&self.settings, SAMPLE_RATE).unwrap_or(self.default_sample_rate)
    }

    fn amplitude(&self) -> f64 {
        lookup_or_log::<f32>(&self.settings, "amplitude").map_or(1.0, f64::from)
    }

    fn frequency(&self) -> f64 {
        lookup_or_log::<f32>(&self.settings, "frequency").map_or(1.0, f64::from)
    }

    fn trigger_interval(&self) -> Option<u64> {
        lookup_or_log::<i64>(&self.settings, "trigger_interval")
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0)
    }

    fn trigger_name(&self) -> String {
        lookup_or_log(&self.settings, TRIGGER_NAME)
            .unwrap_or_else(|| DEFAULT_TRIGGER_NAME.to_string())
    }

    fn signal_tag(&self) -> PropertyMap {
        let amplitude = self.amplitude() as f32;
        let mut map = crate::property_map! {
            SIGNAL_NAME => self.signal_name(),
            SIGNAL_MIN => -amplitude.abs(),
            SIGNAL_MAX => amplitude.abs(),
            SAMPLE_RATE => self.sample_rate(),
        };
        if let Some(unit) = lookup_or_log::<String>(&self.settings, SIGNAL_UNIT) {
            map.insert(SIGNAL_UNIT.to_string(), unit.into());
        }
        map
    }
}

struct SimDataSetParams {
    block_name: String,
    settings: PropertyMap,
}

impl SimDataSetParams {
    fn from_block(block: &BlockDescriptor) -> Result<Self> {
        if lookup_or_log::<Vec<String>>(&block.settings, SIGNAL_NAMES).is_none() {
            return Err(AcqError::Scheduler(format!(
                "dataset sink '{}' has no '{}' setting",
                block.unique_name, SIGNAL_NAMES
            )));
        }
        Ok(Self {
            block_name: block.unique_name.clone(),
            settings: block.settings.clone(),
        })
    }

    fn signal_names(&self) -> Vec<String> {
        lookup_or_log(&self.settings, SIGNAL_NAMES).unwrap_or_default()
    }

    fn signal_units(&self) -> Vec<String> {
        lookup_or_log(&self.settings, SIGNAL_UNITS).unwrap_or_default()
    }
}

// ==================== Scheduler ====================

/// Scheduler producing synthetic data for the sinks of one graph
pub struct SimScheduler {
    unique_name: String,
    ports: SchedulerPorts,
    registry: SinkRegistry,
    config: SimulationConfig,
    sinks: Vec<SimSinkParams>,
    dataset_sinks: Vec<SimDataSetParams>,
}

struct RunningSink {
    params: SimSinkParams,
    handle: DataSinkHandle,
    produced: u64,
    announce: bool,
}

struct RunningDataSetSink {
    params: SimDataSetParams,
    handle: DataSetSinkHandle,
    produced: u64,
}

#[derive(Default)]
struct Subscriptions {
    lifecycle: bool,
    settings: bool,
}

impl Scheduler for SimScheduler {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn run_and_wait(self: Box<Self>) {
        let SimScheduler {
            unique_name,
            ports,
            registry,
            config,
            sinks,
            dataset_sinks,
        } = *self;

        let mut running: Vec<RunningSink> = sinks
            .into_iter()
            .map(|params| RunningSink {
                handle: registry.register_sink(params.signal_name(), params.sample_rate()),
                params,
                produced: 0,
                announce: true,
            })
            .collect();
        let mut running_datasets: Vec<RunningDataSetSink> = dataset_sinks
            .into_iter()
            .map(|params| RunningDataSetSink {
                handle: registry.register_dataset_sink(params.signal_names()),
                params,
                produced: 0,
            })
            .collect();

        tracing::info!("Scheduler {} running", unique_name);
        let mut subscriptions = Subscriptions::default();
        let mut last_tick = Instant::now();

        'run: loop {
            loop {
                match ports.msg_in.try_recv() {
                    Ok(message) => {
                        let stop = handle_message(
                            &unique_name,
                            &ports,
                            &mut subscriptions,
                            &mut running,
                            &mut running_datasets,
                            message,
                        );
                        if stop {
                            break 'run;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!("Scheduler {} lost its controller", unique_name);
                        break 'run;
                    }
                }
            }

            for sink in running.iter_mut() {
                produce_block(sink, config.block_size);
            }
            for sink in running_datasets.iter_mut() {
                produce_dataset(sink, config.block_size);
            }

            // Rate limiting
            let elapsed = last_tick.elapsed();
            if elapsed < config.tick() {
                std::thread::sleep(config.tick() - elapsed);
            }
            last_tick = Instant::now();
        }

        for sink in &running {
            sink.handle.finish();
        }
        for sink in &running_datasets {
            sink.handle.finish();
        }
        drop(running);
        drop(running_datasets);

        let _ = ports
            .msg_out
            .send(Message::lifecycle_notification(&unique_name, LifecycleState::Stopped));
        tracing::info!("Scheduler {} stopped", unique_name);
    }
}

/// Returns true when a stop was requested
fn handle_message(
    scheduler_name: &str,
    ports: &SchedulerPorts,
    subscriptions: &mut Subscriptions,
    sinks: &mut [RunningSink],
    dataset_sinks: &mut [RunningDataSetSink],
    message: Message,
) -> bool {
    match (message.command, message.endpoint.as_str()) {
        (Command::Subscribe, LIFECYCLE_STATE_ENDPOINT) => {
            subscriptions.lifecycle = true;
            let _ = ports.msg_out.send(Message::lifecycle_notification(
                scheduler_name,
                LifecycleState::Running,
            ));
        }
        (Command::Unsubscribe, LIFECYCLE_STATE_ENDPOINT) => subscriptions.lifecycle = false,
        (Command::Subscribe, SETTINGS_ENDPOINT) => subscriptions.settings = true,
        (Command::Unsubscribe, SETTINGS_ENDPOINT) => subscriptions.settings = false,
        (Command::Set, LIFECYCLE_STATE_ENDPOINT) => {
            let requested = message
                .data
                .as_ref()
                .and_then(|data| lookup_or_log::<String>(data, STATE_KEY))
                .and_then(|state| state.parse::<LifecycleState>().ok());
            match requested {
                Some(LifecycleState::RequestedStop) | Some(LifecycleState::Stopped) => {
                    tracing::debug!("Scheduler {} asked to stop", scheduler_name);
                    if subscriptions.lifecycle {
                        let _ = ports.msg_out.send(Message::lifecycle_notification(
                            scheduler_name,
                            LifecycleState::RequestedStop,
                        ));
                    }
                    return true;
                }
                other => tracing::debug!("Ignoring lifecycle request {:?}", other),
            }
        }
        (Command::Set, SETTINGS_ENDPOINT) => {
            let Some(update) = message.data else {
                return false;
            };
            apply_settings(ports, subscriptions, sinks, dataset_sinks, &message.service_name, &update);
        }
        (Command::Get, SETTINGS_ENDPOINT) => {
            let target = message.service_name.as_str();
            for sink in sinks.iter().filter(|s| target.is_empty() || s.params.block_name == target) {
                let _ = ports.msg_out.send(Message::settings_notification(
                    sink.params.block_name.clone(),
                    sink.params.settings.clone(),
                ));
            }
            for sink in dataset_sinks
                .iter()
                .filter(|s| target.is_empty() || s.params.block_name == target)
            {
                let _ = ports.msg_out.send(Message::settings_notification(
                    sink.params.block_name.clone(),
                    sink.params.settings.clone(),
                ));
            }
        }
        (command, endpoint) => {
            tracing::trace!("Scheduler ignoring {:?} on '{}'", command, endpoint);
        }
    }
    false
}

fn apply_settings(
    ports: &SchedulerPorts,
    subscriptions: &Subscriptions,
    sinks: &mut [RunningSink],
    dataset_sinks: &mut [RunningDataSetSink],
    target: &str,
    update: &PropertyMap,
) {
    for sink in sinks
        .iter_mut()
        .filter(|s| target.is_empty() || s.params.block_name == target)
    {
        sink.params
            .settings
            .extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
        sink.handle.set_signal_name(sink.params.signal_name());
        sink.handle.set_sample_rate(sink.params.sample_rate());
        sink.announce = true;
        if subscriptions.settings {
            let _ = ports.msg_out.send(Message::settings_notification(
                sink.params.block_name.clone(),
                sink.params.settings.clone(),
            ));
        }
    }

    for sink in dataset_sinks
        .iter_mut()
        .filter(|s| target.is_empty() || s.params.block_name == target)
    {
        sink.params
            .settings
            .extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
        sink.handle.set_signal_names(sink.params.signal_names());
        if subscriptions.settings {
            let _ = ports.msg_out.send(Message::settings_notification(
                sink.params.block_name.clone(),
                sink.params.settings.clone(),
            ));
        }
    }
}

fn produce_block(sink: &mut RunningSink, block_size: usize) {
    let params = &sink.params;
    let rate = f64::from(params.sample_rate()).max(f64::MIN_POSITIVE);
    let waveform = Waveform::parse(lookup_or_log(&params.settings, "waveform"));
    let (amplitude, frequency) = (params.amplitude(), params.frequency());

    let start = sink.produced;
    let samples: Vec<f64> = (0..block_size as u64)
        .map(|i| waveform.sample(amplitude, frequency, (start + i) as f64 / rate))
        .collect();

    let mut tags = Vec::new();
    if sink.announce {
        tags.push(Tag::new(0, params.signal_tag()));
        sink.announce = false;
    }
    if let Some(interval) = params.trigger_interval() {
        let first = start.div_ceil(interval) * interval;
        let name = params.trigger_name();
        let mut at = first;
        while at < start + block_size as u64 {
            let time_ns = (at as f64 / rate * 1e9) as i64;
            tags.push(Tag::new(
                (at - start) as usize,
                crate::property_map! { TRIGGER_NAME => name.as_str(), TRIGGER_TIME => time_ns },
            ));
            at += interval;
        }
    }

    sink.handle.publish(&samples, &tags);
    sink.produced += block_size as u64;
}

fn produce_dataset(sink: &mut RunningDataSetSink, block_size: usize) {
    let names = sink.params.signal_names();
    let units = sink.params.signal_units();
    let amplitude = lookup_or_log::<f32>(&sink.params.settings, "amplitude").map_or(1.0, f64::from);
    let trigger_name = lookup_or_log::<String>(&sink.params.settings, TRIGGER_NAME);
    let n = names.len();

    let mut values = Vec::with_capacity(n * block_size);
    for signal in 0..n {
        let phase = signal as f64 / n.max(1) as f64;
        values.extend((0..block_size).map(|i| {
            amplitude * (TAU * (i as f64 / block_size.max(1) as f64 + phase)).sin()
        }));
    }

    let timing_events = (0..n)
        .map(|_| match &trigger_name {
            Some(name) => vec![Tag::new(0, crate::property_map! { TRIGGER_NAME => name.as_str() })],
            None => Vec::new(),
        })
        .collect();

    sink.handle.publish(&DataSet {
        signal_names: names,
        signal_units: units,
        signal_ranges: vec![vec![-amplitude, amplitude]; n],
        extents: vec![n, block_size],
        signal_errors: vec![0.0; values.len()],
        signal_values: values,
        timing_events,
    });
    sink.produced += 1;
}
