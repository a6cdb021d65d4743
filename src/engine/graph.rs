//! Graph model and textual graph descriptions.
//!
//! The worker only needs a narrow view of a processing graph: the list of
//! blocks with their unique names, type names and settings. Sink blocks are
//! recognised by the prefix of their type name.
//!
//! # Description format
//!
//! ```toml
//! [[blocks]]
//! name = "sink_voltage"
//! type = "DataSink<float64>"
//!
//! [blocks.settings]
//! signal_name = "voltage"
//! signal_unit = "V"
//! sample_rate = 1000.0
//! ```

use crate::engine::property::{PropertyMap, PropertyValue};
use crate::error::{AcqError, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Type-name prefix of single-signal sinks
pub const DATA_SINK_PREFIX: &str = "DataSink";

/// Type-name prefix of multi-signal dataset sinks
pub const DATASET_SINK_PREFIX: &str = "DataSetSink";

/// Kind of sink a block represents, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// One signal described by `signal_name` / `signal_unit` / `sample_rate`
    Single,
    /// Several signals described by `signal_names` / `signal_units`
    Multi,
}

impl SinkKind {
    /// Classify a block by its type name
    pub fn classify(type_name: &str) -> Option<Self> {
        // "DataSetSink" does not start with "DataSink", but check the longer one first anyway
        if type_name.starts_with(DATASET_SINK_PREFIX) {
            Some(SinkKind::Multi)
        } else if type_name.starts_with(DATA_SINK_PREFIX) {
            Some(SinkKind::Single)
        } else {
            None
        }
    }
}

/// One block of a processing graph
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDescriptor {
    pub unique_name: String,
    pub type_name: String,
    pub settings: PropertyMap,
}

impl BlockDescriptor {
    pub fn new(unique_name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            type_name: type_name.into(),
            settings: PropertyMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: PropertyMap) -> Self {
        self.settings = settings;
        self
    }

    pub fn sink_kind(&self) -> Option<SinkKind> {
        SinkKind::classify(&self.type_name)
    }
}

/// A processing graph ready to be handed to a scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    blocks: Vec<BlockDescriptor>,
}

#[derive(Deserialize)]
struct GraphDescription {
    #[serde(default)]
    blocks: Vec<BlockEntry>,
}

#[derive(Deserialize)]
struct BlockEntry {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    settings: toml::Table,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block, builder style
    pub fn with_block(mut self, block: BlockDescriptor) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn add_block(&mut self, block: BlockDescriptor) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<BlockDescriptor> {
        self.blocks
    }

    pub fn for_each_block(&self, mut f: impl FnMut(&BlockDescriptor)) {
        for block in &self.blocks {
            f(block);
        }
    }

    /// Blocks that are single- or multi-signal sinks
    pub fn sink_blocks(&self) -> impl Iterator<Item = (&BlockDescriptor, SinkKind)> {
        self.blocks
            .iter()
            .filter_map(|b| b.sink_kind().map(|kind| (b, kind)))
    }

    /// Parse a textual graph description
    pub fn from_description(text: &str) -> Result<Self> {
        let description: GraphDescription =
            toml::from_str(text).map_err(|e| AcqError::GraphDescription(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut graph = Graph::new();
        for entry in description.blocks {
            if entry.name.trim().is_empty() {
                return Err(AcqError::GraphDescription(
                    "block with empty name".to_string(),
                ));
            }
            if entry.type_name.trim().is_empty() {
                return Err(AcqError::GraphDescription(format!(
                    "block '{}' has an empty type",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.clone()) {
                return Err(AcqError::GraphDescription(format!(
                    "duplicate block name '{}'",
                    entry.name
                )));
            }

            let mut settings = PropertyMap::new();
            for (key, value) in entry.settings {
                let value = convert_setting(&value).ok_or_else(|| {
                    AcqError::GraphDescription(format!(
                        "unsupported value for setting '{}' of block '{}'",
                        key, entry.name
                    ))
                })?;
                settings.insert(key, value);
            }

            graph.add_block(BlockDescriptor {
                unique_name: entry.name,
                type_name: entry.type_name,
                settings,
            });
        }
        Ok(graph)
    }
}

fn convert_setting(value: &toml::Value) -> Option<PropertyValue> {
    match value {
        toml::Value::String(s) => Some(PropertyValue::String(s.clone())),
        toml::Value::Integer(i) => Some(PropertyValue::Int(*i)),
        toml::Value::Float(f) => Some(PropertyValue::Float(*f as f32)),
        toml::Value::Boolean(b) => Some(PropertyValue::Bool(*b)),
        toml::Value::Array(items) if items.iter().all(|v| v.is_str()) => Some(
            PropertyValue::StringList(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
        ),
        toml::Value::Array(items) => items
            .iter()
            .map(|v| match v {
                toml::Value::Float(f) => Some(*f as f32),
                toml::Value::Integer(i) => Some(*i as f32),
                _ => None,
            })
            .collect::<Option<Vec<f32>>>()
            .map(PropertyValue::FloatList),
        toml::Value::Table(table) => table
            .iter()
            .map(|(k, v)| convert_setting(v).map(|v| (k.clone(), v)))
            .collect::<Option<PropertyMap>>()
            .map(PropertyValue::Map),
        toml::Value::Datetime(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::property::get_property;

    const DESCRIPTION: &str = r#"
[[blocks]]
name = "source"
type = "SignalGenerator<float64>"

[[blocks]]
name = "sink_a"
type = "DataSink<float64>"

[blocks.settings]
signal_name = "voltage"
signal_unit = "V"
sample_rate = 1000.0

[[blocks]]
name = "ds"
type = "DataSetSink<float64>"

[blocks.settings]
signal_names = ["A", "B"]
signal_units = ["V", "A"]
"#;

    #[test]
    fn test_sink_classification() {
        assert_eq!(SinkKind::classify("DataSink<double>"), Some(SinkKind::Single));
        assert_eq!(SinkKind::classify("DataSetSink<double>"), Some(SinkKind::Multi));
        assert_eq!(SinkKind::classify("SignalGenerator"), None);
    }

    #[test]
    fn test_parse_description() {
        let graph = Graph::from_description(DESCRIPTION).unwrap();
        assert_eq!(graph.blocks().len(), 3);

        let sinks: Vec<_> = graph.sink_blocks().collect();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].0.unique_name, "sink_a");
        assert_eq!(sinks[0].1, SinkKind::Single);
        assert_eq!(
            get_property::<f32>(&sinks[0].0.settings, "sample_rate").unwrap(),
            Some(1000.0)
        );
        assert_eq!(
            get_property::<Vec<String>>(&sinks[1].0.settings, "signal_names").unwrap(),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn test_parse_rejects_duplicate_names() {
        let text = "[[blocks]]\nname = \"a\"\ntype = \"X\"\n[[blocks]]\nname = \"a\"\ntype = \"Y\"\n";
        let err = Graph::from_description(text).unwrap_err();
        assert!(err.is_graph_description());
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        let err = Graph::from_description("[[blocks]]\nname = \"a\"\n").unwrap_err();
        assert!(err.is_graph_description());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Graph::from_description("this is not a graph").is_err());
    }

    #[test]
    fn test_empty_description_is_empty_graph() {
        let graph = Graph::from_description("").unwrap();
        assert!(graph.blocks().is_empty());
    }
}
