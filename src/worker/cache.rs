//! Mark-and-sweep cache of taps
//!
//! Each reconciliation pass starts with [`PollerCache::begin_pass`], which
//! clears the `in_use` mark of every entry. Entries touched during the pass
//! are claimed; [`PollerCache::sweep`] then drops whatever was not claimed.
//! Dropping an entry releases the tap, which detaches it from its sink.

use crate::engine::property::{lookup_or_log, Tag, SIGNAL_MAX, SIGNAL_MIN, SIGNAL_NAME, SIGNAL_UNIT};
use crate::taps::{DataSetTap, StreamingTap};
use crate::types::SubscriptionKey;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cached tap and its pass mark
pub struct TapEntry<T> {
    pub poller: T,
    in_use: bool,
}

impl<T> TapEntry<T> {
    fn new(poller: T) -> Self {
        Self {
            poller,
            in_use: false,
        }
    }

    /// Mark the entry as used in the current pass
    pub fn claim(&mut self) {
        self.in_use = true;
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

/// Cache of taps keyed by canonical subscription key
pub struct PollerCache<T> {
    entries: BTreeMap<SubscriptionKey, TapEntry<T>>,
}

impl<T> Default for PollerCache<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PollerCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every `in_use` mark
    pub fn begin_pass(&mut self) {
        for entry in self.entries.values_mut() {
            entry.in_use = false;
        }
    }

    /// Look up `key`, creating the entry with `create` on first use
    ///
    /// A `None` from `create` is not cached, so creation is retried on the
    /// next lookup.
    pub fn get_or_try_create(
        &mut self,
        key: &SubscriptionKey,
        create: impl FnOnce() -> Option<T>,
    ) -> Option<&mut TapEntry<T>> {
        if !self.entries.contains_key(key) {
            let poller = create()?;
            tracing::debug!("Created tap for {}", key);
            self.entries.insert(key.clone(), TapEntry::new(poller));
        }
        self.entries.get_mut(key)
    }

    /// Drop every entry not claimed since the last `begin_pass`
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if !entry.in_use {
                tracing::debug!("Evicting unused tap for {}", key);
            }
            entry.in_use
        });
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }
}

/// Last signal metadata seen on a stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingMetadata {
    pub signal_name: Option<String>,
    pub signal_unit: Option<String>,
    pub signal_min: Option<f32>,
    pub signal_max: Option<f32>,
}

impl StreamingMetadata {
    /// Update from signal tags; mistyped values are logged and skipped
    pub fn populate_from_tags(&mut self, tags: &[Tag]) {
        for tag in tags {
            if let Some(name) = lookup_or_log::<String>(&tag.map, SIGNAL_NAME) {
                self.signal_name = Some(name);
            }
            if let Some(unit) = lookup_or_log::<String>(&tag.map, SIGNAL_UNIT) {
                self.signal_unit = Some(unit);
            }
            if let Some(min) = lookup_or_log::<f32>(&tag.map, SIGNAL_MIN) {
                self.signal_min = Some(min);
            }
            if let Some(max) = lookup_or_log::<f32>(&tag.map, SIGNAL_MAX) {
                self.signal_max = Some(max);
            }
        }
    }
}

/// Cached streaming tap with the metadata observed on it
pub struct StreamingEntry {
    pub tap: Arc<dyn StreamingTap>,
    pub metadata: StreamingMetadata,
}

impl StreamingEntry {
    pub fn new(tap: Arc<dyn StreamingTap>) -> Self {
        Self {
            tap,
            metadata: StreamingMetadata::default(),
        }
    }
}

/// Cached windowed or dataset tap
pub struct DataSetEntry {
    pub tap: Arc<dyn DataSetTap>,
}

impl DataSetEntry {
    pub fn new(tap: Arc<dyn DataSetTap>) -> Self {
        Self { tap }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::property::PropertyMap;

    #[test]
    fn test_create_once() {
        let mut cache: PollerCache<u32> = PollerCache::new();
        let key = SubscriptionKey::continuous("A");
        let mut created = 0;
        for _ in 0..3 {
            cache.get_or_try_create(&key, || {
                created += 1;
                Some(7)
            });
        }
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_creation_not_cached() {
        let mut cache: PollerCache<u32> = PollerCache::new();
        let key = SubscriptionKey::continuous("A");
        assert!(cache.get_or_try_create(&key, || None).is_none());
        assert!(!cache.contains(&key));
        assert!(cache.get_or_try_create(&key, || Some(1)).is_some());
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_unclaimed_entries_swept() {
        let mut cache: PollerCache<u32> = PollerCache::new();
        let a = SubscriptionKey::continuous("A");
        let b = SubscriptionKey::continuous("B");

        cache.begin_pass();
        if let Some(entry) = cache.get_or_try_create(&a, || Some(1)) {
            entry.claim();
        }
        cache.get_or_try_create(&b, || Some(2));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));

        // next pass without claims evicts the rest
        cache.begin_pass();
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_metadata_from_tags() {
        let mut meta = StreamingMetadata::default();
        meta.populate_from_tags(&[
            Tag::new(0, crate::property_map! { SIGNAL_NAME => "A", SIGNAL_MIN => -2.0f32 }),
            Tag::new(3, crate::property_map! { SIGNAL_UNIT => "V", SIGNAL_MAX => 2.0f32 }),
            // wrong type is skipped
            Tag::new(4, crate::property_map! { SIGNAL_MAX => 5.0f64 }),
            Tag::new(5, PropertyMap::new()),
        ]);
        assert_eq!(meta.signal_name.as_deref(), Some("A"));
        assert_eq!(meta.signal_unit.as_deref(), Some("V"));
        assert_eq!(meta.signal_min, Some(-2.0));
        assert_eq!(meta.signal_max, Some(2.0));
    }
}
