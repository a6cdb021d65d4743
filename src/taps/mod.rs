//! Data taps on a running processing graph
//!
//! A tap ("poller") is a consumer handle attached to one sink of the graph.
//! The worker looks taps up through a [`TapRegistry`], drains them on its own
//! cadence and drops them when no subscriber needs them any more. Dropping the
//! last handle detaches the tap from its sink, so a sink never blocks on a
//! consumer that went away.
//!
//! # Tap Kinds
//!
//! - [`StreamingTap`] - raw sample batches with their tags
//! - [`DataSetTap`] - completed [`DataSet`]s, produced by trigger, snapshot,
//!   multiplexed and dataset taps alike

pub mod registry;

pub use registry::{DataSetSinkHandle, DataSinkHandle, SinkRegistry};

use crate::engine::property::Tag;
use std::sync::Arc;
use std::time::Duration;

/// Consumer of raw sample batches
pub trait StreamingTap: Send + Sync {
    /// Whether the producing sink has finished; no more data will arrive
    /// after the buffered data is drained
    fn finished(&self) -> bool;

    /// Drain all currently buffered samples in one call
    ///
    /// Returns `true` when `f` was invoked with at least one sample.
    fn process(&self, f: &mut dyn FnMut(&[f64], &[Tag])) -> bool;
}

/// Consumer of completed datasets
pub trait DataSetTap: Send + Sync {
    /// Whether the producing sink has finished
    fn finished(&self) -> bool;

    /// Deliver at most one dataset
    ///
    /// Returns `true` when `f` was invoked.
    fn process_one(&self, f: &mut dyn FnMut(&DataSet)) -> bool;
}

/// A block of samples for one or more signals
///
/// `signal_values` holds one slice of `extents[1]` samples per signal, in
/// the order of `signal_names`. Windowed taps produce single-signal datasets
/// with `extents = [1, n]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    pub signal_names: Vec<String>,
    pub signal_units: Vec<String>,
    /// `[min, max]` per signal when known
    pub signal_ranges: Vec<Vec<f64>>,
    pub extents: Vec<usize>,
    pub signal_values: Vec<f64>,
    pub signal_errors: Vec<f64>,
    /// Timing events per signal
    pub timing_events: Vec<Vec<Tag>>,
}

impl DataSet {
    /// Number of samples per signal
    pub fn samples_per_signal(&self) -> usize {
        match self.extents.as_slice() {
            [_, samples, ..] => *samples,
            [samples] => *samples,
            [] => self.signal_values.len(),
        }
    }
}

/// Outcome of evaluating a trigger predicate against a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The tag starts (or is) an acquisition
    Matching,
    /// The tag is a trigger, but not the requested one
    NotMatching,
    /// The tag is not relevant
    Ignore,
}

/// Decides whether a tag is a trigger a windowed tap should react to
pub trait TriggerPredicate: Send + Sync {
    fn evaluate(&self, tag: &Tag) -> MatchResult;
}

/// Selects the sink a tap attaches to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkQuery {
    signal_name: String,
}

impl SinkQuery {
    /// Match the sink (or dataset sink channel) carrying this signal name
    pub fn signal_name(name: impl Into<String>) -> Self {
        Self {
            signal_name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.signal_name
    }
}

/// Lookup and creation of taps
///
/// Every method returns `None` when no tap can be created right now, for
/// example because no sink carries the requested signal yet. Callers retry
/// on a later cycle.
#[cfg_attr(test, mockall::automock)]
pub trait TapRegistry: Send + Sync {
    fn streaming_tap(&self, query: &SinkQuery) -> Option<Arc<dyn StreamingTap>>;

    fn trigger_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        pre_samples: usize,
        post_samples: usize,
    ) -> Option<Arc<dyn DataSetTap>>;

    fn snapshot_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        delay: Duration,
    ) -> Option<Arc<dyn DataSetTap>>;

    fn multiplexed_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        maximum_window_size: usize,
    ) -> Option<Arc<dyn DataSetTap>>;

    fn dataset_tap(&self, query: &SinkQuery) -> Option<Arc<dyn DataSetTap>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_per_signal() {
        let ds = DataSet {
            extents: vec![2, 100],
            ..DataSet::default()
        };
        assert_eq!(ds.samples_per_signal(), 100);

        let flat = DataSet {
            signal_values: vec![0.0; 7],
            ..DataSet::default()
        };
        assert_eq!(flat.samples_per_signal(), 7);
    }

    #[test]
    fn test_query_name() {
        assert_eq!(SinkQuery::signal_name("voltage").name(), "voltage");
    }
}
