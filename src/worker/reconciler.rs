//! Subscription reconciliation
//!
//! Each pass maps every active subscription to one cache key per requested
//! channel, makes sure a tap exists for the key, drains it and publishes one
//! reply per drained batch or dataset. Taps no subscription touched during
//! the pass are evicted at its end.
//!
//! The pass also reports whether every tap it touched had already finished
//! before it was drained. While a scheduler is stopping, the worker repeats
//! passes until that holds so no buffered data is lost.

use crate::broker::{ReplyPublisher, Subscription, SubscriptionSource};
use crate::error::Result;
use crate::taps::{SinkQuery, TapRegistry};
use crate::types::{Acquisition, AcquisitionMode, SubscriptionKey, TimeDomainFilter};
use crate::worker::cache::{DataSetEntry, PollerCache, StreamingEntry};
use crate::worker::reply::{build_dataset_reply, build_streaming_reply};
use crate::worker::trigger::TriggerNameMatcher;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pause between passes while draining for teardown
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one or more reconciliation passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    /// Every touched tap was finished before it was drained
    pub pollers_finished: bool,
    /// Replies handed to the publisher
    pub replies: usize,
    /// Subscriptions that could not be interpreted
    pub skipped_subscriptions: usize,
    /// Passes run
    pub passes: usize,
}

impl Default for PassOutcome {
    fn default() -> Self {
        Self {
            pollers_finished: true,
            replies: 0,
            skipped_subscriptions: 0,
            passes: 0,
        }
    }
}

/// Owns the tap caches and drives them from the active subscriptions
pub struct SubscriptionReconciler {
    registry: Arc<dyn TapRegistry>,
    streaming: PollerCache<StreamingEntry>,
    datasets: PollerCache<DataSetEntry>,
}

impl SubscriptionReconciler {
    pub fn new(registry: Arc<dyn TapRegistry>) -> Self {
        Self {
            registry,
            streaming: PollerCache::new(),
            datasets: PollerCache::new(),
        }
    }

    /// Run one pass over `subscriptions`
    pub fn reconcile_pass(
        &mut self,
        subscriptions: &[Subscription],
        publisher: &dyn ReplyPublisher,
    ) -> PassOutcome {
        self.streaming.begin_pass();
        self.datasets.begin_pass();

        let mut outcome = PassOutcome {
            passes: 1,
            ..PassOutcome::default()
        };
        for subscription in subscriptions {
            if let Err(e) = self.handle_subscription(&subscription.filter, publisher, &mut outcome) {
                tracing::warn!("Could not handle subscription {}: {}", subscription.topic, e);
                outcome.skipped_subscriptions += 1;
            }
        }

        // drop taps of old subscriptions so their sinks do not fill up
        self.streaming.sweep();
        self.datasets.sweep();
        outcome
    }

    /// Repeat passes until every touched tap reports finished or `deadline`
    /// passes; subscriptions are re-read for every pass
    pub fn reconcile_until_idle(
        &mut self,
        source: &dyn SubscriptionSource,
        publisher: &dyn ReplyPublisher,
        deadline: Instant,
    ) -> PassOutcome {
        let mut total = PassOutcome::default();
        loop {
            let subscriptions = source.active_subscriptions();
            let pass = self.reconcile_pass(&subscriptions, publisher);
            total.replies += pass.replies;
            total.skipped_subscriptions += pass.skipped_subscriptions;
            total.passes += 1;
            total.pollers_finished = pass.pollers_finished;

            if pass.pollers_finished {
                return total;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Taps still not finished after {} passes, tearing down anyway",
                    total.passes
                );
                return total;
            }
            std::thread::sleep(DRAIN_RETRY_INTERVAL);
        }
    }

    /// Drop every cached tap
    pub fn clear(&mut self) {
        self.streaming.clear();
        self.datasets.clear();
    }

    pub fn streaming_taps(&self) -> usize {
        self.streaming.len()
    }

    pub fn dataset_taps(&self) -> usize {
        self.datasets.len()
    }

    pub fn has_tap(&self, key: &SubscriptionKey) -> bool {
        self.streaming.contains(key) || self.datasets.contains(key)
    }

    fn handle_subscription(
        &mut self,
        filter: &TimeDomainFilter,
        publisher: &dyn ReplyPublisher,
        outcome: &mut PassOutcome,
    ) -> Result<()> {
        let mode = filter.acquisition_mode()?;
        for signal_name in filter.channel_names() {
            let key = SubscriptionKey::from_filter(mode, signal_name, filter)?;
            let finished = if mode.is_streaming() {
                self.handle_streaming(filter, key, publisher, outcome)
            } else {
                self.handle_dataset(filter, key, publisher, outcome)
            };
            if !finished {
                outcome.pollers_finished = false;
            }
        }
        Ok(())
    }

    fn handle_streaming(
        &mut self,
        filter: &TimeDomainFilter,
        key: SubscriptionKey,
        publisher: &dyn ReplyPublisher,
        outcome: &mut PassOutcome,
    ) -> bool {
        let signal_name = key.signal_name.as_str();
        let registry = &self.registry;
        let Some(entry) = self.streaming.get_or_try_create(&key, || {
            registry
                .streaming_tap(&SinkQuery::signal_name(signal_name))
                .map(StreamingEntry::new)
        }) else {
            // nothing to drain yet
            return true;
        };
        entry.claim();

        let StreamingEntry { tap, metadata } = &mut entry.poller;
        let was_finished = tap.finished();
        let mut reply: Option<Acquisition> = None;
        let drained = tap.process(&mut |samples, tags| {
            metadata.populate_from_tags(tags);
            reply = Some(build_streaming_reply(metadata, signal_name, samples));
        });
        if drained {
            if let Some(mut reply) = reply {
                reply.stamp_now();
                tracing::trace!("Streaming reply for {} ({} samples)", key, reply.channel_value.len());
                publisher.notify(filter, &reply);
                outcome.replies += 1;
            }
        }
        was_finished
    }

    fn handle_dataset(
        &mut self,
        filter: &TimeDomainFilter,
        key: SubscriptionKey,
        publisher: &dyn ReplyPublisher,
        outcome: &mut PassOutcome,
    ) -> bool {
        let mode = key.mode;
        let signal_name = key.signal_name.as_str();
        let registry = &self.registry;
        let Some(entry) = self.datasets.get_or_try_create(&key, || {
            let query = SinkQuery::signal_name(signal_name);
            let matcher = Arc::new(TriggerNameMatcher::new(key.trigger_name.clone()));
            let tap = match mode {
                AcquisitionMode::Triggered => {
                    registry.trigger_tap(&query, matcher, key.pre_samples, key.post_samples)
                }
                AcquisitionMode::Snapshot => {
                    registry.snapshot_tap(&query, matcher, key.snapshot_delay)
                }
                AcquisitionMode::Multiplexed => {
                    registry.multiplexed_tap(&query, matcher, key.maximum_window_size)
                }
                AcquisitionMode::DataSet => registry.dataset_tap(&query),
                AcquisitionMode::Continuous => None,
            };
            tap.map(DataSetEntry::new)
        }) else {
            return true;
        };
        entry.claim();

        let tap = &entry.poller.tap;
        let was_finished = tap.finished();
        loop {
            let mut reply: Option<Acquisition> = None;
            let produced = tap.process_one(&mut |dataset| {
                reply = build_dataset_reply(mode, signal_name, dataset);
            });
            if !produced {
                break;
            }
            if let Some(mut reply) = reply {
                reply.stamp_now();
                tracing::trace!("Dataset reply for {} ({} samples)", key, reply.channel_value.len());
                publisher.notify(filter, &reply);
                outcome.replies += 1;
            }
        }
        was_finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockReplyPublisher;
    use crate::engine::property::Tag;
    use crate::taps::{DataSet, DataSetTap, MockTapRegistry, StreamingTap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Streaming tap that yields each queued batch once
    #[derive(Default)]
    struct ScriptedStreamingTap {
        batches: Mutex<Vec<Vec<f64>>>,
        finished: AtomicBool,
    }

    impl ScriptedStreamingTap {
        fn with_batches(batches: Vec<Vec<f64>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                finished: AtomicBool::new(false),
            }
        }
    }

    impl StreamingTap for ScriptedStreamingTap {
        fn finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }

        fn process(&self, f: &mut dyn FnMut(&[f64], &[Tag])) -> bool {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return false;
            }
            let batch = batches.remove(0);
            f(&batch, &[]);
            true
        }
    }

    struct ScriptedDataSetTap {
        datasets: Mutex<Vec<DataSet>>,
    }

    impl DataSetTap for ScriptedDataSetTap {
        fn finished(&self) -> bool {
            false
        }

        fn process_one(&self, f: &mut dyn FnMut(&DataSet)) -> bool {
            let mut datasets = self.datasets.lock().unwrap();
            if datasets.is_empty() {
                return false;
            }
            let ds = datasets.remove(0);
            f(&ds);
            true
        }
    }

    fn subscription(filter: TimeDomainFilter) -> Subscription {
        Subscription {
            topic: filter.to_query(),
            filter,
        }
    }

    #[test]
    fn test_equivalent_filters_share_one_tap() {
        let mut registry = MockTapRegistry::new();
        registry.expect_streaming_tap().times(1).returning(|_| {
            Some(Arc::new(ScriptedStreamingTap::with_batches(vec![vec![1.0, 2.0]])) as Arc<dyn StreamingTap>)
        });
        let mut publisher = MockReplyPublisher::new();
        publisher.expect_notify().times(1).return_const(());

        let mut a = TimeDomainFilter::continuous("A");
        a.pre_samples = 10;
        let b = TimeDomainFilter::continuous("A");

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(&[subscription(a), subscription(b)], &publisher);
        assert_eq!(reconciler.streaming_taps(), 1);
        // first subscription drains the batch, the second finds nothing new
        assert_eq!(outcome.replies, 1);

        let outcome = reconciler.reconcile_pass(
            &[subscription(TimeDomainFilter::continuous("A"))],
            &publisher,
        );
        assert_eq!(outcome.replies, 0);
    }

    #[test]
    fn test_exhausted_registry_retried_next_pass() {
        let mut registry = MockTapRegistry::new();
        let mut calls = 0;
        registry.expect_streaming_tap().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                None
            } else {
                Some(Arc::new(ScriptedStreamingTap::default()) as Arc<dyn StreamingTap>)
            }
        });
        let publisher = MockReplyPublisher::new();
        let subs = [subscription(TimeDomainFilter::continuous("A"))];

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(&subs, &publisher);
        assert!(outcome.pollers_finished);
        assert_eq!(reconciler.streaming_taps(), 0);

        reconciler.reconcile_pass(&subs, &publisher);
        assert_eq!(reconciler.streaming_taps(), 1);
    }

    #[test]
    fn test_unused_tap_evicted() {
        let mut registry = MockTapRegistry::new();
        registry
            .expect_streaming_tap()
            .returning(|_| Some(Arc::new(ScriptedStreamingTap::default()) as Arc<dyn StreamingTap>));
        let publisher = MockReplyPublisher::new();

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        reconciler.reconcile_pass(&[subscription(TimeDomainFilter::continuous("A,B"))], &publisher);
        assert_eq!(reconciler.streaming_taps(), 2);

        reconciler.reconcile_pass(&[subscription(TimeDomainFilter::continuous("B"))], &publisher);
        assert_eq!(reconciler.streaming_taps(), 1);
        assert!(reconciler.has_tap(&SubscriptionKey::continuous("B")));
        assert!(!reconciler.has_tap(&SubscriptionKey::continuous("A")));
    }

    #[test]
    fn test_invalid_mode_skipped() {
        let registry = MockTapRegistry::new();
        let publisher = MockReplyPublisher::new();
        let mut bad = TimeDomainFilter::continuous("A");
        bad.acquisition_mode_filter = "burst".to_string();

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(&[subscription(bad)], &publisher);
        assert_eq!(outcome.skipped_subscriptions, 1);
        assert!(outcome.pollers_finished);
    }

    #[test]
    fn test_unfinished_tap_reported() {
        let mut registry = MockTapRegistry::new();
        registry
            .expect_streaming_tap()
            .returning(|_| Some(Arc::new(ScriptedStreamingTap::default()) as Arc<dyn StreamingTap>));
        let publisher = MockReplyPublisher::new();

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome =
            reconciler.reconcile_pass(&[subscription(TimeDomainFilter::continuous("A"))], &publisher);
        assert!(!outcome.pollers_finished);
    }

    #[test]
    fn test_dataset_path_one_reply_per_dataset() {
        let mut registry = MockTapRegistry::new();
        registry.expect_trigger_tap().times(1).returning(|_, _, pre, post| {
            assert_eq!((pre, post), (5, 7));
            let ds = DataSet {
                signal_names: vec!["A".into()],
                extents: vec![1, 2],
                signal_values: vec![1.0, 2.0],
                ..DataSet::default()
            };
            Some(Arc::new(ScriptedDataSetTap {
                datasets: Mutex::new(vec![ds.clone(), ds.clone(), ds]),
            }) as Arc<dyn DataSetTap>)
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut publisher = MockReplyPublisher::new();
        let sink = Arc::clone(&seen);
        publisher.expect_notify().returning(move |_, reply: &Acquisition| {
            sink.lock().unwrap().push(reply.channel_value.clone());
        });

        let mut filter = TimeDomainFilter::for_mode(AcquisitionMode::Triggered, "A");
        filter.pre_samples = 5;
        filter.post_samples = 7;

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(&[subscription(filter)], &publisher);
        assert_eq!(outcome.replies, 3);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(seen.lock().unwrap()[0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_dataset_mode_skips_absent_signal() {
        let mut registry = MockTapRegistry::new();
        registry.expect_dataset_tap().returning(|_| {
            Some(Arc::new(ScriptedDataSetTap {
                datasets: Mutex::new(vec![DataSet {
                    signal_names: vec!["X".into()],
                    extents: vec![1, 1],
                    signal_values: vec![1.0],
                    ..DataSet::default()
                }]),
            }) as Arc<dyn DataSetTap>)
        });
        let mut publisher = MockReplyPublisher::new();
        publisher.expect_notify().never();

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(
            &[subscription(TimeDomainFilter::for_mode(AcquisitionMode::DataSet, "A"))],
            &publisher,
        );
        assert_eq!(outcome.replies, 0);
    }

    #[test]
    fn test_negative_window_skipped() {
        let registry = MockTapRegistry::new();
        let publisher = MockReplyPublisher::new();
        let mut filter = TimeDomainFilter::for_mode(AcquisitionMode::Multiplexed, "A");
        filter.maximum_window_size = -4;

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_pass(&[subscription(filter)], &publisher);
        assert_eq!(outcome.skipped_subscriptions, 1);
        assert_eq!(reconciler.dataset_taps(), 0);
    }

    #[test]
    fn test_until_idle_stops_at_deadline() {
        let mut registry = MockTapRegistry::new();
        registry
            .expect_streaming_tap()
            .returning(|_| Some(Arc::new(ScriptedStreamingTap::default()) as Arc<dyn StreamingTap>));
        let mut source = crate::broker::MockSubscriptionSource::new();
        source
            .expect_active_subscriptions()
            .returning(|| vec![subscription(TimeDomainFilter::continuous("A"))]);
        let publisher = MockReplyPublisher::new();

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_until_idle(
            &source,
            &publisher,
            Instant::now() + Duration::from_millis(20),
        );
        assert!(!outcome.pollers_finished);
        assert!(outcome.passes >= 1);
    }

    #[test]
    fn test_until_idle_returns_once_finished() {
        let tap = Arc::new(ScriptedStreamingTap::with_batches(vec![vec![1.0]]));
        tap.finished.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&tap);
        let mut registry = MockTapRegistry::new();
        registry
            .expect_streaming_tap()
            .returning(move |_| Some(Arc::clone(&shared) as Arc<dyn StreamingTap>));
        let mut source = crate::broker::MockSubscriptionSource::new();
        source
            .expect_active_subscriptions()
            .returning(|| vec![subscription(TimeDomainFilter::continuous("A"))]);
        let mut publisher = MockReplyPublisher::new();
        publisher.expect_notify().times(1).return_const(());

        let mut reconciler = SubscriptionReconciler::new(Arc::new(registry));
        let outcome = reconciler.reconcile_until_idle(
            &source,
            &publisher,
            Instant::now() + Duration::from_secs(5),
        );
        assert!(outcome.pollers_finished);
        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.replies, 1);
    }
}
