//! Signal metadata tracking
//!
//! The tracker keeps the [`SignalEntry`] list of every sink block of the
//! running graph. It is seeded from the block settings when a graph is
//! installed and updated from settings notifications while it runs. The
//! published list is the concatenation of all sinks, ordered by sink name and
//! then by channel index.

use crate::engine::graph::{Graph, SinkKind};
use crate::engine::property::{
    lookup_or_log, PropertyMap, SAMPLE_RATE, SIGNAL_NAME, SIGNAL_NAMES, SIGNAL_UNIT, SIGNAL_UNITS,
};
use crate::types::SignalEntry;
use std::collections::BTreeMap;

/// Sample rate reported for channels that carry none
pub const DEFAULT_SAMPLE_RATE: f32 = 1.0;

/// Receives the flattened signal list whenever it changes
///
/// Called from the worker thread. An empty list means the graph went away.
pub trait SignalEntryObserver: Send {
    fn signal_entries_changed(&self, entries: &[SignalEntry]);
}

impl<F> SignalEntryObserver for F
where
    F: Fn(&[SignalEntry]) + Send,
{
    fn signal_entries_changed(&self, entries: &[SignalEntry]) {
        self(entries)
    }
}

#[derive(Debug, Clone)]
struct SinkSignals {
    kind: SinkKind,
    entries: Vec<SignalEntry>,
}

/// Per-sink signal metadata with change detection
#[derive(Debug, Default)]
pub struct SignalMetadataTracker {
    sinks: BTreeMap<String, SinkSignals>,
    dirty: bool,
}

impl SignalMetadataTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked sinks with those of `graph`
    pub fn seed_from_graph(&mut self, graph: &Graph) {
        self.sinks.clear();
        for (block, kind) in graph.sink_blocks() {
            let entries = match kind {
                SinkKind::Single => vec![SignalEntry::new(
                    lookup_or_log::<String>(&block.settings, SIGNAL_NAME).unwrap_or_default(),
                    lookup_or_log::<String>(&block.settings, SIGNAL_UNIT).unwrap_or_default(),
                    lookup_or_log::<f32>(&block.settings, SAMPLE_RATE).unwrap_or(DEFAULT_SAMPLE_RATE),
                )],
                SinkKind::Multi => {
                    let names = lookup_or_log::<Vec<String>>(&block.settings, SIGNAL_NAMES);
                    let units = lookup_or_log::<Vec<String>>(&block.settings, SIGNAL_UNITS);
                    if names.is_none() || units.is_none() {
                        tracing::warn!(
                            "Dataset sink '{}' lacks '{}' or '{}'",
                            block.unique_name,
                            SIGNAL_NAMES,
                            SIGNAL_UNITS
                        );
                    }
                    zip_entries(&names.unwrap_or_default(), &units.unwrap_or_default(), &[])
                }
            };
            self.sinks
                .insert(block.unique_name.clone(), SinkSignals { kind, entries });
        }
        self.dirty = true;
    }

    /// Apply a settings notification from block `sink`
    ///
    /// Unknown sinks are ignored. Fields absent from `settings` are left
    /// untouched. Returns whether anything changed.
    pub fn apply_setting_update(&mut self, sink: &str, settings: &PropertyMap) -> bool {
        let Some(signals) = self.sinks.get_mut(sink) else {
            return false;
        };

        let changed = match signals.kind {
            SinkKind::Single => {
                signals.entries.resize_with(1, || SignalEntry::new("", "", DEFAULT_SAMPLE_RATE));
                let entry = &mut signals.entries[0];
                let mut changed = false;
                if let Some(name) = lookup_or_log::<String>(settings, SIGNAL_NAME) {
                    if name != entry.name {
                        entry.name = name;
                        changed = true;
                    }
                }
                if let Some(unit) = lookup_or_log::<String>(settings, SIGNAL_UNIT) {
                    if unit != entry.unit {
                        entry.unit = unit;
                        changed = true;
                    }
                }
                if let Some(rate) = lookup_or_log::<f32>(settings, SAMPLE_RATE) {
                    if rate != entry.sample_rate {
                        entry.sample_rate = rate;
                        changed = true;
                    }
                }
                changed
            }
            SinkKind::Multi => {
                let names = lookup_or_log::<Vec<String>>(settings, SIGNAL_NAMES);
                let units = lookup_or_log::<Vec<String>>(settings, SIGNAL_UNITS);
                if names.is_none() && units.is_none() {
                    false
                } else {
                    let names = names.unwrap_or_else(|| {
                        signals.entries.iter().map(|e| e.name.clone()).collect()
                    });
                    let units = units.unwrap_or_else(|| {
                        signals.entries.iter().map(|e| e.unit.clone()).collect()
                    });
                    let updated = zip_entries(&names, &units, &signals.entries);
                    if updated != signals.entries {
                        signals.entries = updated;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        self.dirty |= changed;
        changed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// All entries, sink by sink
    pub fn flattened(&self) -> Vec<SignalEntry> {
        self.sinks
            .values()
            .flat_map(|s| s.entries.iter().cloned())
            .collect()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Forget all sinks
    pub fn clear(&mut self) {
        self.sinks.clear();
        self.dirty = false;
    }

    /// Push the current list to `observer` and reset the change flag
    pub fn publish(&mut self, observer: Option<&dyn SignalEntryObserver>) {
        self.dirty = false;
        if let Some(observer) = observer {
            observer.signal_entries_changed(&self.flattened());
        }
    }
}

/// Pair names with units, keeping previous sample rates by index
fn zip_entries(names: &[String], units: &[String], previous: &[SignalEntry]) -> Vec<SignalEntry> {
    names
        .iter()
        .zip(units)
        .enumerate()
        .map(|(i, (name, unit))| {
            let rate = previous.get(i).map_or(DEFAULT_SAMPLE_RATE, |e| e.sample_rate);
            SignalEntry::new(name.clone(), unit.clone(), rate)
        })
        .collect()
}
