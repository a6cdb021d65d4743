//! Trigger name matching for windowed taps

use crate::engine::property::{PropertyValue, Tag, TRIGGER_NAME};
use crate::taps::{MatchResult, TriggerPredicate};

/// Matches timing events against the trigger name a subscriber asked for
///
/// | requested | tag has `trigger_name` | result |
/// |---|---|---|
/// | `""` | yes (any value) | `Matching` |
/// | `""` | no | `Ignore` |
/// | `"T1"` | `"T1"` | `Matching` |
/// | `"T1"` | other string or non-string | `NotMatching` |
/// | `"T1"` | no | `Ignore` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerNameMatcher {
    trigger_name: String,
}

impl TriggerNameMatcher {
    pub fn new(trigger_name: impl Into<String>) -> Self {
        Self {
            trigger_name: trigger_name.into(),
        }
    }

    pub fn trigger_name(&self) -> &str {
        &self.trigger_name
    }
}

impl TriggerPredicate for TriggerNameMatcher {
    fn evaluate(&self, tag: &Tag) -> MatchResult {
        let value = tag.get(TRIGGER_NAME);
        if self.trigger_name.is_empty() {
            return match value {
                Some(_) => MatchResult::Matching,
                None => MatchResult::Ignore,
            };
        }
        match value {
            None => MatchResult::Ignore,
            Some(PropertyValue::String(name)) if *name == self.trigger_name => MatchResult::Matching,
            Some(_) => MatchResult::NotMatching,
        }
    }
}
