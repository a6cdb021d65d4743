//! Property values, property maps and stream tags.
//!
//! Block settings, message payloads and stream tags all carry loosely typed
//! key/value maps. Lookups are strict: a key stored with a different variant
//! than the one requested is a [`AcqError::TypeMismatch`], never a silent
//! conversion.

use crate::error::{AcqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag key carrying the human-readable signal name
pub const SIGNAL_NAME: &str = "signal_name";
/// Tag key carrying the signal unit
pub const SIGNAL_UNIT: &str = "signal_unit";
/// Tag key carrying the lower bound of the signal range
pub const SIGNAL_MIN: &str = "signal_min";
/// Tag key carrying the upper bound of the signal range
pub const SIGNAL_MAX: &str = "signal_max";
/// Tag/setting key carrying the sample rate in Hz
pub const SAMPLE_RATE: &str = "sample_rate";
/// Tag key carrying the name of a timing event
pub const TRIGGER_NAME: &str = "trigger_name";
/// Tag key carrying the time of a timing event in nanoseconds
pub const TRIGGER_TIME: &str = "trigger_time";

/// Setting key listing the signal names of a multi-signal sink
pub const SIGNAL_NAMES: &str = "signal_names";
/// Setting key listing the signal units of a multi-signal sink
pub const SIGNAL_UNITS: &str = "signal_units";

/// A loosely typed value stored in a [`PropertyMap`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    FloatList(Vec<f32>),
    Map(BTreeMap<String, PropertyValue>),
}

/// Ordered key/value map used for settings, tags and message payloads
pub type PropertyMap = BTreeMap<String, PropertyValue>;

impl PropertyValue {
    /// Name of the stored variant, used in mismatch diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Double(_) => "double",
            PropertyValue::String(_) => "string",
            PropertyValue::StringList(_) => "string list",
            PropertyValue::FloatList(_) => "float list",
            PropertyValue::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        PropertyValue::StringList(v)
    }
}

/// Strict extraction of a concrete type from a [`PropertyValue`]
pub trait FromProperty: Sized {
    /// Human-readable name of the expected variant
    const EXPECTED: &'static str;

    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl FromProperty for String {
    const EXPECTED: &'static str = "string";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromProperty for f32 {
    const EXPECTED: &'static str = "float";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for f64 {
    const EXPECTED: &'static str = "double";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for i64 {
    const EXPECTED: &'static str = "int";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_int()
    }
}

impl FromProperty for bool {
    const EXPECTED: &'static str = "bool";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromProperty for Vec<String> {
    const EXPECTED: &'static str = "string list";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::StringList(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromProperty for Vec<f32> {
    const EXPECTED: &'static str = "float list";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::FloatList(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Look up `key` and extract it as `T`.
///
/// Returns `Ok(None)` when the key is absent and
/// [`AcqError::TypeMismatch`] when it is present with another variant.
pub fn get_property<T: FromProperty>(map: &PropertyMap, key: &str) -> Result<Option<T>> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => T::from_property(value).map(Some).ok_or_else(|| {
            AcqError::TypeMismatch {
                key: key.to_string(),
                expected: T::EXPECTED,
            }
        }),
    }
}

/// Like [`get_property`], but logs a type mismatch and treats it as absent
pub fn lookup_or_log<T: FromProperty>(map: &PropertyMap, key: &str) -> Option<T> {
    match get_property(map, key) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("{}", e);
            None
        }
    }
}

/// A tag attached to a sample position in a stream
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tag {
    /// Sample index the tag refers to, relative to the batch it is delivered with
    pub index: usize,
    /// Tag payload
    pub map: PropertyMap,
}

impl Tag {
    pub fn new(index: usize, map: PropertyMap) -> Self {
        Self { index, map }
    }

    /// Raw access to a tag entry
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.map.get(key)
    }

    /// Same tag moved to another sample index
    pub fn at(&self, index: usize) -> Self {
        Self {
            index,
            map: self.map.clone(),
        }
    }
}

/// Build a [`PropertyMap`] from `key => value` pairs
#[macro_export]
macro_rules! property_map {
    () => { $crate::engine::property::PropertyMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::engine::property::PropertyMap::new();
        $( map.insert($key.to_string(), $crate::engine::property::PropertyValue::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_property_present() {
        let map = crate::property_map! { SIGNAL_NAME => "voltage", SIGNAL_MIN => -1.0f32 };
        assert_eq!(
            get_property::<String>(&map, SIGNAL_NAME).unwrap(),
            Some("voltage".to_string())
        );
        assert_eq!(get_property::<f32>(&map, SIGNAL_MIN).unwrap(), Some(-1.0));
    }

    #[test]
    fn test_get_property_absent() {
        let map = PropertyMap::new();
        assert_eq!(get_property::<String>(&map, SIGNAL_UNIT).unwrap(), None);
    }

    #[test]
    fn test_get_property_type_mismatch() {
        let map = crate::property_map! { SIGNAL_MIN => 1.0f64 };
        let err = get_property::<f32>(&map, SIGNAL_MIN).unwrap_err();
        assert!(matches!(err, AcqError::TypeMismatch { expected: "float", .. }));
    }

    #[test]
    fn test_lookup_or_log_treats_mismatch_as_absent() {
        let map = crate::property_map! { SIGNAL_UNIT => 3i64 };
        assert_eq!(lookup_or_log::<String>(&map, SIGNAL_UNIT), None);
    }

    #[test]
    fn test_tag_reindex() {
        let tag = Tag::new(10, crate::property_map! { TRIGGER_NAME => "T1" });
        let moved = tag.at(2);
        assert_eq!(moved.index, 2);
        assert_eq!(moved.get(TRIGGER_NAME).and_then(|v| v.as_str()), Some("T1"));
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(PropertyValue::from("x").type_name(), "string");
        assert_eq!(PropertyValue::from(1.0f32).type_name(), "float");
        assert_eq!(PropertyValue::from(vec!["a".to_string()]).type_name(), "string list");
    }
}
