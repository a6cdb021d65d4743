//! Core data types for sigtap
//!
//! This module contains the data structures shared by the acquisition worker,
//! the broker and the command-line front end.
//!
//! # Main Types
//!
//! - [`AcquisitionMode`] - How a subscriber wants a signal delivered
//! - [`TimeDomainFilter`] - The subscriber filter as it arrives from the broker
//! - [`SubscriptionKey`] - Canonical form of a filter for one channel; equal keys share a tap
//! - [`SignalEntry`] - Published metadata of one logical channel
//! - [`Acquisition`] - Reply sent to subscribers
//!
//! # Filter Normalisation
//!
//! Continuous subscriptions are keyed by signal name only, so two streaming
//! subscribers with different window parameters still share one tap. Every
//! other mode keys on all window parameters plus the trigger name.

use crate::error::{AcqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Trigger name reported for continuous replies
pub const STREAMING_TRIGGER_NAME: &str = "STREAMING";

/// Unit reported when a signal has no known unit
pub const UNKNOWN_UNIT: &str = "N/A";

/// Acquisition semantics requested by a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Every sample, as it arrives
    Continuous,
    /// A fixed window of samples around each matching trigger
    Triggered,
    /// A window opened by a matching trigger and closed by the next non-matching one
    Multiplexed,
    /// A single sample at a fixed delay after each matching trigger
    Snapshot,
    /// Whole multi-signal datasets
    DataSet,
}

impl AcquisitionMode {
    /// Lowercase wire name of the mode
    pub fn as_str(self) -> &'static str {
        match self {
            AcquisitionMode::Continuous => "continuous",
            AcquisitionMode::Triggered => "triggered",
            AcquisitionMode::Multiplexed => "multiplexed",
            AcquisitionMode::Snapshot => "snapshot",
            AcquisitionMode::DataSet => "dataset",
        }
    }

    /// Whether the mode is served by a streaming tap
    pub fn is_streaming(self) -> bool {
        self == AcquisitionMode::Continuous
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcquisitionMode {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "continuous" => Ok(AcquisitionMode::Continuous),
            "triggered" => Ok(AcquisitionMode::Triggered),
            "multiplexed" => Ok(AcquisitionMode::Multiplexed),
            "snapshot" => Ok(AcquisitionMode::Snapshot),
            "dataset" => Ok(AcquisitionMode::DataSet),
            other => Err(AcqError::InvalidAcquisitionMode(other.to_string())),
        }
    }
}

// ==================== Subscriber Filter ====================

/// Subscriber filter (context) as delivered by the broker
///
/// Field names on the wire follow the broker's camel-case convention. The
/// filter is also the routing key for replies, hence `Eq` and `Hash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeDomainFilter {
    /// One of the lowercase [`AcquisitionMode`] names
    pub acquisition_mode_filter: String,
    /// Comma-separated list of signal names
    pub channel_name_filter: String,
    /// Samples before the trigger (triggered mode)
    pub pre_samples: i64,
    /// Samples after the trigger (triggered mode)
    pub post_samples: i64,
    /// Upper bound of a multiplexed window in samples
    pub maximum_window_size: i64,
    /// Delay after the trigger in nanoseconds (snapshot mode)
    pub snapshot_delay: i64,
    /// Trigger name to match; empty matches any trigger
    pub trigger_name_filter: String,
}

impl TimeDomainFilter {
    /// Continuous filter for the given channels
    pub fn continuous(channels: impl Into<String>) -> Self {
        Self {
            acquisition_mode_filter: AcquisitionMode::Continuous.as_str().to_string(),
            channel_name_filter: channels.into(),
            ..Self::default()
        }
    }

    /// Filter for `mode` on the given channels with all parameters zeroed
    pub fn for_mode(mode: AcquisitionMode, channels: impl Into<String>) -> Self {
        Self {
            acquisition_mode_filter: mode.as_str().to_string(),
            channel_name_filter: channels.into(),
            ..Self::default()
        }
    }

    /// Parse the acquisition mode
    pub fn acquisition_mode(&self) -> Result<AcquisitionMode> {
        self.acquisition_mode_filter.parse()
    }

    /// Requested channel names in order; empty entries are skipped
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channel_name_filter
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Parse a URL-style query such as
    /// `acquisitionModeFilter=triggered&channelNameFilter=A,B&preSamples=10`
    pub fn from_query(query: &str) -> Result<Self> {
        let mut filter = Self::default();
        let query = query.trim().trim_start_matches('?');

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| AcqError::invalid_filter(pair, ""))?;
            match key {
                "acquisitionModeFilter" => filter.acquisition_mode_filter = value.to_string(),
                "channelNameFilter" => filter.channel_name_filter = value.to_string(),
                "preSamples" => filter.pre_samples = parse_int(key, value)?,
                "postSamples" => filter.post_samples = parse_int(key, value)?,
                "maximumWindowSize" => filter.maximum_window_size = parse_int(key, value)?,
                "snapshotDelay" => filter.snapshot_delay = parse_int(key, value)?,
                "triggerNameFilter" => filter.trigger_name_filter = value.to_string(),
                _ => return Err(AcqError::invalid_filter(key, value)),
            }
        }
        Ok(filter)
    }

    /// Render the filter back into query form
    pub fn to_query(&self) -> String {
        format!(
            "acquisitionModeFilter={}&channelNameFilter={}&preSamples={}&postSamples={}&maximumWindowSize={}&snapshotDelay={}&triggerNameFilter={}",
            self.acquisition_mode_filter,
            self.channel_name_filter,
            self.pre_samples,
            self.post_samples,
            self.maximum_window_size,
            self.snapshot_delay,
            self.trigger_name_filter
        )
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| AcqError::invalid_filter(key, value))
}

fn non_negative(field: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| AcqError::invalid_filter(field, value.to_string()))
}

// ==================== Subscription Key ====================

/// Canonical description of the tap a subscription needs
///
/// Field order defines the ordering: mode first, then signal name, then the
/// window parameters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    pub mode: AcquisitionMode,
    pub signal_name: String,
    pub pre_samples: usize,
    pub post_samples: usize,
    pub maximum_window_size: usize,
    pub snapshot_delay: Duration,
    pub trigger_name: String,
}

impl SubscriptionKey {
    /// Key of a continuous subscription; only the signal name matters
    pub fn continuous(signal_name: impl Into<String>) -> Self {
        Self {
            mode: AcquisitionMode::Continuous,
            signal_name: signal_name.into(),
            pre_samples: 0,
            post_samples: 0,
            maximum_window_size: 0,
            snapshot_delay: Duration::ZERO,
            trigger_name: String::new(),
        }
    }

    /// Key of a windowed or dataset subscription
    ///
    /// Negative sample counts or delays are rejected.
    pub fn windowed(
        mode: AcquisitionMode,
        signal_name: impl Into<String>,
        filter: &TimeDomainFilter,
    ) -> Result<Self> {
        let delay_ns = u64::try_from(filter.snapshot_delay)
            .map_err(|_| AcqError::invalid_filter("snapshotDelay", filter.snapshot_delay.to_string()))?;
        Ok(Self {
            mode,
            signal_name: signal_name.into(),
            pre_samples: non_negative("preSamples", filter.pre_samples)?,
            post_samples: non_negative("postSamples", filter.post_samples)?,
            maximum_window_size: non_negative("maximumWindowSize", filter.maximum_window_size)?,
            snapshot_delay: Duration::from_nanos(delay_ns),
            trigger_name: filter.trigger_name_filter.clone(),
        })
    }

    /// Key for `signal_name` under the filter's mode
    pub fn from_filter(
        mode: AcquisitionMode,
        signal_name: &str,
        filter: &TimeDomainFilter,
    ) -> Result<Self> {
        if mode.is_streaming() {
            Ok(Self::continuous(signal_name))
        } else {
            Self::windowed(mode, signal_name, filter)
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            AcquisitionMode::Continuous => write!(f, "{}:{}", self.mode, self.signal_name),
            _ => write!(
                f,
                "{}:{} pre={} post={} max={} delay={:?} trigger='{}'",
                self.mode,
                self.signal_name,
                self.pre_samples,
                self.post_samples,
                self.maximum_window_size,
                self.snapshot_delay,
                self.trigger_name
            ),
        }
    }
}

// ==================== Signal Metadata ====================

/// Metadata of one logical channel of a sink
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SignalEntry {
    pub name: String,
    pub unit: String,
    pub sample_rate: f32,
}

impl SignalEntry {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, sample_rate: f32) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            sample_rate,
        }
    }
}

impl Default for SignalEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            unit: String::new(),
            sample_rate: 1.0,
        }
    }
}

// ==================== Reply ====================

/// Reply delivered to a subscriber for one drained batch or dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acquisition {
    pub acq_trigger_name: String,
    pub channel_name: String,
    pub channel_unit: String,
    pub channel_range_min: f32,
    pub channel_range_max: f32,
    pub channel_value: Vec<f32>,
    pub channel_error: Vec<f32>,
    pub channel_time_base: Vec<i64>,
    /// Wall-clock time the reply was produced, in nanoseconds since the epoch
    pub acq_local_time_stamp: i64,
}

impl Default for Acquisition {
    fn default() -> Self {
        Self {
            acq_trigger_name: String::new(),
            channel_name: String::new(),
            channel_unit: String::new(),
            channel_range_min: f32::MIN,
            channel_range_max: f32::MAX,
            channel_value: Vec::new(),
            channel_error: Vec::new(),
            channel_time_base: Vec::new(),
            acq_local_time_stamp: 0,
        }
    }
}

impl Acquisition {
    /// Stamp the reply with the current wall-clock time
    pub fn stamp_now(&mut self) {
        self.acq_local_time_stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    }
}
