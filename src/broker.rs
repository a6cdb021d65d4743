//! Subscription broker contract and an in-process broker
//!
//! The worker reads the active subscriber filters through a
//! [`SubscriptionSource`] on every cycle and pushes replies through a
//! [`ReplyPublisher`]. A reply is addressed by the filter (context) it was
//! produced for; the broker routes it to every subscriber holding an equal
//! filter.
//!
//! [`LocalBroker`] implements both traits with one bounded crossbeam queue
//! per subscriber. A slow subscriber loses replies instead of stalling the
//! worker.

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::types::{Acquisition, TimeDomainFilter};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// An active subscription as seen by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: TimeDomainFilter,
    /// Topic string the subscription was made with, used in diagnostics
    pub topic: String,
}

/// Source of the currently active subscriptions
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionSource: Send + Sync {
    /// Distinct active subscriptions; re-read on every cycle
    fn active_subscriptions(&self) -> Vec<Subscription>;
}

/// Sink for replies
#[cfg_attr(test, mockall::automock)]
pub trait ReplyPublisher: Send + Sync {
    fn notify(&self, context: &TimeDomainFilter, reply: &Acquisition);
}

// ==================== Local Broker ====================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscriber {
    subscription: Subscription,
    tx: Sender<Acquisition>,
    dropped: u64,
}

struct BrokerInner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process broker, cheap to clone
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

/// Counters of a [`LocalBroker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped: u64,
}

impl LocalBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                capacity: config.subscriber_capacity,
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe with a filter; the subscription ends when the handle is dropped
    pub fn subscribe(&self, filter: TimeDomainFilter) -> SubscriptionHandle {
        let topic = filter.to_query();
        self.subscribe_with_topic(filter, topic)
    }

    /// Subscribe with a URL-style query such as
    /// `acquisitionModeFilter=continuous&channelNameFilter=A`
    pub fn subscribe_query(&self, query: &str) -> Result<SubscriptionHandle> {
        let filter = TimeDomainFilter::from_query(query)?;
        Ok(self.subscribe_with_topic(filter, query.to_string()))
    }

    fn subscribe_with_topic(&self, filter: TimeDomainFilter, topic: String) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.inner.capacity);
        let subscription = Subscription { filter, topic };
        tracing::debug!("Subscriber {} added: {}", id, subscription.topic);
        lock(&self.inner.subscribers).insert(
            id,
            Subscriber {
                subscription: subscription.clone(),
                tx,
                dropped: 0,
            },
        );
        SubscriptionHandle {
            id,
            subscription,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            subscribers: lock(&self.inner.subscribers).len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

impl SubscriptionSource for LocalBroker {
    fn active_subscriptions(&self) -> Vec<Subscription> {
        let subscribers = lock(&self.inner.subscribers);
        let mut ids: Vec<_> = subscribers.keys().copied().collect();
        ids.sort_unstable();

        let mut active: Vec<Subscription> = Vec::new();
        for id in ids {
            if let Some(subscriber) = subscribers.get(&id) {
                if !active.iter().any(|s| s.filter == subscriber.subscription.filter) {
                    active.push(subscriber.subscription.clone());
                }
            }
        }
        active
    }
}

impl ReplyPublisher for LocalBroker {
    fn notify(&self, context: &TimeDomainFilter, reply: &Acquisition) {
        let mut subscribers = lock(&self.inner.subscribers);
        for (id, subscriber) in subscribers
            .iter_mut()
            .filter(|(_, s)| s.subscription.filter == *context)
        {
            match subscriber.tx.try_send(reply.clone()) {
                Ok(()) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped += 1;
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    if subscriber.dropped.is_power_of_two() {
                        tracing::warn!(
                            "Subscriber {} is not keeping up, {} replies dropped",
                            id,
                            subscriber.dropped
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// Receiving end of a subscription; unsubscribes on drop
pub struct SubscriptionHandle {
    id: u64,
    subscription: Subscription,
    rx: Receiver<Acquisition>,
    broker: Weak<BrokerInner>,
}

impl SubscriptionHandle {
    pub fn filter(&self) -> &TimeDomainFilter {
        &self.subscription.filter
    }

    pub fn topic(&self) -> &str {
        &self.subscription.topic
    }

    pub fn try_recv(&self) -> Option<Acquisition> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next reply
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Acquisition> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take every reply queued so far
    pub fn drain(&self) -> Vec<Acquisition> {
        self.rx.try_iter().collect()
    }

    /// Underlying receiver, for use with `crossbeam_channel::select!`
    pub fn receiver(&self) -> &Receiver<Acquisition> {
        &self.rx
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            lock(&broker.subscribers).remove(&self.id);
            tracing::debug!("Subscriber {} removed", self.id);
        }
    }
}
