//! Test data builders for graphs and filters

use sigtap::engine::property::{
    PropertyValue, SAMPLE_RATE, SIGNAL_NAME, SIGNAL_NAMES, SIGNAL_UNIT, SIGNAL_UNITS, TRIGGER_NAME,
};
use sigtap::{AcquisitionMode, BlockDescriptor, Graph, TimeDomainFilter};

/// Builder for a single-signal sink block
pub struct SinkBuilder {
    block: BlockDescriptor,
}

impl SinkBuilder {
    pub fn new(block_name: &str, signal_name: &str) -> Self {
        let mut block = BlockDescriptor::new(block_name, "DataSink<float32>");
        block
            .settings
            .insert(SIGNAL_NAME.to_string(), signal_name.into());
        Self { block }
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.block.settings.insert(SIGNAL_UNIT.to_string(), unit.into());
        self
    }

    pub fn sample_rate(mut self, rate: f32) -> Self {
        self.block.settings.insert(SAMPLE_RATE.to_string(), rate.into());
        self
    }

    pub fn amplitude(mut self, amplitude: f32) -> Self {
        self.block
            .settings
            .insert("amplitude".to_string(), amplitude.into());
        self
    }

    pub fn waveform(mut self, waveform: &str) -> Self {
        self.block
            .settings
            .insert("waveform".to_string(), waveform.into());
        self
    }

    /// Emit a trigger tag every `interval` samples
    pub fn triggers(mut self, interval: i64, name: &str) -> Self {
        self.block
            .settings
            .insert("trigger_interval".to_string(), PropertyValue::Int(interval));
        self.block.settings.insert(TRIGGER_NAME.to_string(), name.into());
        self
    }

    pub fn build(self) -> BlockDescriptor {
        self.block
    }
}

/// Multi-signal sink block
pub fn dataset_sink(block_name: &str, names: &[&str], units: &[&str]) -> BlockDescriptor {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let units: Vec<String> = units.iter().map(|s| s.to_string()).collect();
    let mut block = BlockDescriptor::new(block_name, "DataSetSink<float32>");
    block.settings.insert(SIGNAL_NAMES.to_string(), names.into());
    block.settings.insert(SIGNAL_UNITS.to_string(), units.into());
    block
}

/// Graph with a non-sink source block followed by `sinks`
pub fn graph_with(sinks: Vec<BlockDescriptor>) -> Graph {
    let mut graph = Graph::new().with_block(BlockDescriptor::new("source", "SignalGenerator<float32>"));
    for sink in sinks {
        graph.add_block(sink);
    }
    graph
}

/// Triggered filter with a window around each trigger
pub fn triggered(channels: &str, pre: i64, post: i64, trigger: &str) -> TimeDomainFilter {
    TimeDomainFilter {
        pre_samples: pre,
        post_samples: post,
        trigger_name_filter: trigger.to_string(),
        ..TimeDomainFilter::for_mode(AcquisitionMode::Triggered, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_builder() {
        let block = SinkBuilder::new("sink", "A").unit("V").sample_rate(10.0).build();
        assert_eq!(block.sink_kind(), Some(sigtap::engine::SinkKind::Single));
        assert_eq!(block.settings.len(), 3);
    }
}
