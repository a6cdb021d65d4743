//! In-process sink registry
//!
//! [`SinkRegistry`] is the producer side of the tap contract. Graph sinks
//! register themselves and publish samples (or whole datasets) through their
//! handles; the worker asks the registry for taps by signal name.
//!
//! A sink only holds weak references to its taps. Publishing upgrades them,
//! feeds the live ones and prunes the rest, so a consumer that drops its
//! last `Arc` detaches itself and the producer never waits on it. Every
//! buffer is bounded: on overflow the oldest data is discarded and counted.

use crate::config::TapConfig;
use crate::engine::property::{
    lookup_or_log, PropertyMap, Tag, SIGNAL_MAX, SIGNAL_MIN, SIGNAL_NAME, SIGNAL_UNIT,
};
use crate::taps::{
    DataSet, DataSetTap, MatchResult, SinkQuery, StreamingTap, TapRegistry, TriggerPredicate,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==================== Registry ====================

/// Registry of live sinks, cheap to clone
#[derive(Clone)]
pub struct SinkRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: TapConfig,
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, Arc<SinkState>>>,
    dataset_sinks: Mutex<HashMap<u64, Arc<DataSetSinkState>>>,
}

impl SinkRegistry {
    pub fn new(config: TapConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                next_id: AtomicU64::new(1),
                sinks: Mutex::new(HashMap::new()),
                dataset_sinks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a single-signal sink
    pub fn register_sink(&self, signal_name: impl Into<String>, sample_rate: f32) -> DataSinkHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SinkState {
            meta: Mutex::new(SinkMeta {
                signal_name: signal_name.into(),
                sample_rate,
                ..SinkMeta::default()
            }),
            taps: Mutex::new(SinkTaps::default()),
            finished: AtomicBool::new(false),
        });
        lock(&self.inner.sinks).insert(id, Arc::clone(&state));
        tracing::debug!("Registered sink {} ({})", id, lock(&state.meta).signal_name);
        DataSinkHandle {
            id,
            state,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Register a multi-signal dataset sink
    pub fn register_dataset_sink(&self, signal_names: Vec<String>) -> DataSetSinkHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(DataSetSinkState {
            signal_names: Mutex::new(signal_names),
            taps: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        });
        lock(&self.inner.dataset_sinks).insert(id, Arc::clone(&state));
        tracing::debug!("Registered dataset sink {}", id);
        DataSetSinkHandle {
            id,
            state,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered sinks of either kind
    pub fn sink_count(&self) -> usize {
        lock(&self.inner.sinks).len() + lock(&self.inner.dataset_sinks).len()
    }

    fn find_sink(&self, query: &SinkQuery) -> Option<Arc<SinkState>> {
        let sinks = lock(&self.inner.sinks);
        let mut matches: Vec<_> = sinks
            .iter()
            .filter(|(_, sink)| lock(&sink.meta).signal_name == query.name())
            .collect();
        // oldest registration wins when names collide
        matches.sort_by_key(|(id, _)| **id);
        matches.first().map(|(_, sink)| Arc::clone(sink))
    }

    fn find_dataset_sink(&self, query: &SinkQuery) -> Option<Arc<DataSetSinkState>> {
        let sinks = lock(&self.inner.dataset_sinks);
        let mut matches: Vec<_> = sinks
            .iter()
            .filter(|(_, sink)| lock(&sink.signal_names).iter().any(|n| n == query.name()))
            .collect();
        matches.sort_by_key(|(id, _)| **id);
        matches.first().map(|(_, sink)| Arc::clone(sink))
    }

    fn windowed_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        window: impl FnOnce(&SinkMeta) -> WindowKind,
    ) -> Option<Arc<dyn DataSetTap>> {
        let sink = self.find_sink(query)?;
        let kind = window(&lock(&sink.meta));
        let tap = Arc::new(WindowedTap::new(
            kind,
            predicate,
            self.inner.config.streaming_capacity,
            self.inner.config.dataset_capacity,
            sink.finished.load(Ordering::Acquire),
        ));
        lock(&sink.taps).windowed.push(Arc::downgrade(&tap));
        Some(tap)
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new(TapConfig::default())
    }
}

impl TapRegistry for SinkRegistry {
    fn streaming_tap(&self, query: &SinkQuery) -> Option<Arc<dyn StreamingTap>> {
        let sink = self.find_sink(query)?;
        let tap = Arc::new(StreamingBufferTap::new(
            self.inner.config.streaming_capacity,
            sink.finished.load(Ordering::Acquire),
        ));
        lock(&sink.taps).streaming.push(Arc::downgrade(&tap));
        Some(tap)
    }

    fn trigger_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        pre_samples: usize,
        post_samples: usize,
    ) -> Option<Arc<dyn DataSetTap>> {
        let (pre, post) =
            clamp_trigger_window(pre_samples, post_samples, self.inner.config.streaming_capacity);
        self.windowed_tap(query, predicate, |_| WindowKind::Trigger { pre, post })
    }

    fn snapshot_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        delay: Duration,
    ) -> Option<Arc<dyn DataSetTap>> {
        self.windowed_tap(query, predicate, |meta| WindowKind::Snapshot {
            delay_samples: (delay.as_secs_f64() * f64::from(meta.sample_rate)).round() as usize,
        })
    }

    fn multiplexed_tap(
        &self,
        query: &SinkQuery,
        predicate: Arc<dyn TriggerPredicate>,
        maximum_window_size: usize,
    ) -> Option<Arc<dyn DataSetTap>> {
        self.windowed_tap(query, predicate, |_| WindowKind::Multiplexed {
            max_window: maximum_window_size,
        })
    }

    fn dataset_tap(&self, query: &SinkQuery) -> Option<Arc<dyn DataSetTap>> {
        let sink = self.find_dataset_sink(query)?;
        let tap = Arc::new(DataSetQueueTap::new(
            self.inner.config.dataset_capacity,
            sink.finished.load(Ordering::Acquire),
        ));
        lock(&sink.taps).push(Arc::downgrade(&tap));
        Some(tap)
    }
}

/// Shrink a trigger window that could never fit in the retained history.
/// `post` is kept first since a match waits for it before emitting.
fn clamp_trigger_window(pre: usize, post: usize, capacity: usize) -> (usize, usize) {
    if pre.saturating_add(post) <= capacity {
        return (pre, post);
    }
    let clamped_post = post.min(capacity);
    let clamped_pre = pre.min(capacity - clamped_post);
    tracing::warn!(
        "Trigger window {}+{} exceeds tap capacity {}, using {}+{}",
        pre,
        post,
        capacity,
        clamped_pre,
        clamped_post
    );
    (clamped_pre, clamped_post)
}

// ==================== Single-Signal Sinks ====================

/// Current metadata of a single-signal sink
#[derive(Debug, Clone, Default)]
struct SinkMeta {
    signal_name: String,
    signal_unit: Option<String>,
    signal_min: Option<f32>,
    signal_max: Option<f32>,
    sample_rate: f32,
}

impl SinkMeta {
    fn update_from_tags(&mut self, tags: &[Tag]) {
        for tag in tags {
            if let Some(name) = lookup_or_log::<String>(&tag.map, SIGNAL_NAME) {
                self.signal_name = name;
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

#[derive(Default)]
struct SinkTaps {
    streaming: Vec<Weak<StreamingBufferTap>>,
    windowed: Vec<Weak<WindowedTap>>,
}

struct SinkState {
    meta: Mutex<SinkMeta>,
    taps: Mutex<SinkTaps>,
    finished: AtomicBool,
}

impl SinkState {
    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        let taps = lock(&self.taps);
        for tap in taps.streaming.iter().filter_map(Weak::upgrade) {
            tap.finished.store(true, Ordering::Release);
        }
        for tap in taps.windowed.iter().filter_map(Weak::upgrade) {
            tap.queue.finished.store(true, Ordering::Release);
        }
    }
}

/// Producer handle of a single-signal sink; unregisters on drop
pub struct DataSinkHandle {
    id: u64,
    state: Arc<SinkState>,
    registry: Weak<RegistryInner>,
}

impl DataSinkHandle {
    /// Feed a batch of samples to every attached tap
    ///
    /// Tag indices are relative to `samples`.
    pub fn publish(&self, samples: &[f64], tags: &[Tag]) {
        let meta = {
            let mut meta = lock(&self.state.meta);
            meta.update_from_tags(tags);
            meta.clone()
        };

        let mut taps = lock(&self.state.taps);
        taps.streaming.retain(|weak| match weak.upgrade() {
            Some(tap) => {
                tap.push(samples, tags);
                true
            }
            None => false,
        });
        taps.windowed.retain(|weak| match weak.upgrade() {
            Some(tap) => {
                tap.push(samples, tags, &meta);
                true
            }
            None => false,
        });
    }

    pub fn signal_name(&self) -> String {
        lock(&self.state.meta).signal_name.clone()
    }

    /// Rename the sink; later queries match the new name
    pub fn set_signal_name(&self, name: impl Into<String>) {
        lock(&self.state.meta).signal_name = name.into();
    }

    pub fn set_sample_rate(&self, sample_rate: f32) {
        lock(&self.state.meta).sample_rate = sample_rate;
    }

    /// Number of taps currently attached and alive
    pub fn tap_count(&self) -> usize {
        let taps = lock(&self.state.taps);
        taps.streaming.iter().filter(|w| w.strong_count() > 0).count()
            + taps.windowed.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Mark the sink and all attached taps finished
    pub fn finish(&self) {
        self.state.finish();
    }
}

impl Drop for DataSinkHandle {
    fn drop(&mut self) {
        self.state.finish();
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry.sinks).remove(&self.id);
        }
    }
}

// ==================== Dataset Sinks ====================

struct DataSetSinkState {
    signal_names: Mutex<Vec<String>>,
    taps: Mutex<Vec<Weak<DataSetQueueTap>>>,
    finished: AtomicBool,
}

/// Producer handle of a multi-signal dataset sink; unregisters on drop
pub struct DataSetSinkHandle {
    id: u64,
    state: Arc<DataSetSinkState>,
    registry: Weak<RegistryInner>,
}

impl DataSetSinkHandle {
    /// Queue a dataset on every attached tap
    pub fn publish(&self, dataset: &DataSet) {
        lock(&self.state.taps).retain(|weak| match weak.upgrade() {
            Some(tap) => {
                tap.queue.push(dataset.clone());
                true
            }
            None => false,
        });
    }

    pub fn set_signal_names(&self, names: Vec<String>) {
        *lock(&self.state.signal_names) = names;
    }

    pub fn tap_count(&self) -> usize {
        lock(&self.state.taps)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn finish(&self) {
        self.state.finished.store(true, Ordering::Release);
        for tap in lock(&self.state.taps).iter().filter_map(Weak::upgrade) {
            tap.queue.finished.store(true, Ordering::Release);
        }
    }
}

impl Drop for DataSetSinkHandle {
    fn drop(&mut self) {
        self.finish();
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry.dataset_sinks).remove(&self.id);
        }
    }
}

// ==================== Streaming Tap ====================

struct StreamingBuffer {
    samples: VecDeque<f64>,
    /// Tags keyed by absolute sample index
    tags: Vec<(u64, PropertyMap)>,
    /// Absolute index of `samples[0]`
    head: u64,
    dropped: u64,
}

struct StreamingBufferTap {
    buffer: Mutex<StreamingBuffer>,
    capacity: usize,
    finished: AtomicBool,
}

impl StreamingBufferTap {
    fn new(capacity: usize, finished: bool) -> Self {
        Self {
            buffer: Mutex::new(StreamingBuffer {
                samples: VecDeque::new(),
                tags: Vec::new(),
                head: 0,
                dropped: 0,
            }),
            capacity,
            finished: AtomicBool::new(finished),
        }
    }

    fn push(&self, samples: &[f64], tags: &[Tag]) {
        let mut buffer = lock(&self.buffer);
        let base = buffer.head + buffer.samples.len() as u64;
        for tag in tags {
            buffer.tags.push((base + tag.index as u64, tag.map.clone()));
        }
        buffer.samples.extend(samples.iter().copied());

        let excess = buffer.samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            buffer.samples.drain(..excess);
            buffer.head += excess as u64;
            buffer.dropped += excess as u64;
            // keep tags of discarded samples so metadata survives
            let head = buffer.head;
            for (index, _) in buffer.tags.iter_mut() {
                if *index < head {
                    *index = head;
                }
            }
            tracing::warn!(
                "Streaming tap overflow, discarded {} samples ({} total)",
                excess,
                buffer.dropped
            );
        }
    }
}

impl StreamingTap for StreamingBufferTap {
    fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn process(&self, f: &mut dyn FnMut(&[f64], &[Tag])) -> bool {
        let (samples, tags) = {
            let mut buffer = lock(&self.buffer);
            if buffer.samples.is_empty() {
                return false;
            }
            let samples: Vec<f64> = buffer.samples.drain(..).collect();
            let head = buffer.head;
            let end = head + samples.len() as u64;
            let (ready, pending): (Vec<_>, Vec<_>) =
                buffer.tags.drain(..).partition(|(index, _)| *index < end);
            buffer.tags = pending;
            buffer.head = end;
            let tags: Vec<Tag> = ready
                .into_iter()
                .map(|(index, map)| Tag::new((index - head) as usize, map))
                .collect();
            (samples, tags)
        };
        f(&samples, &tags);
        true
    }
}

// ==================== Dataset Queue ====================

struct DataSetQueue {
    datasets: Mutex<VecDeque<DataSet>>,
    capacity: usize,
    dropped: AtomicU64,
    finished: AtomicBool,
}

impl DataSetQueue {
    fn new(capacity: usize, finished: bool) -> Self {
        Self {
            datasets: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
            finished: AtomicBool::new(finished),
        }
    }

    fn push(&self, dataset: DataSet) {
        let mut datasets = lock(&self.datasets);
        datasets.push_back(dataset);
        while datasets.len() > self.capacity {
            datasets.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!("Dataset queue full, dropped oldest ({} total)", dropped);
        }
    }

    fn process_one(&self, f: &mut dyn FnMut(&DataSet)) -> bool {
        let next = lock(&self.datasets).pop_front();
        match next {
            Some(dataset) => {
                f(&dataset);
                true
            }
            None => false,
        }
    }
}

struct DataSetQueueTap {
    queue: DataSetQueue,
}

impl DataSetQueueTap {
    fn new(capacity: usize, finished: bool) -> Self {
        Self {
            queue: DataSetQueue::new(capacity, finished),
        }
    }
}

impl DataSetTap for DataSetQueueTap {
    fn finished(&self) -> bool {
        self.queue.finished.load(Ordering::Acquire)
    }

    fn process_one(&self, f: &mut dyn FnMut(&DataSet)) -> bool {
        self.queue.process_one(f)
    }
}

// ==================== Windowed Taps ====================

#[derive(Debug, Clone, Copy)]
enum WindowKind {
    /// `[i - pre, i + post)` around each match
    Trigger { pre: usize, post: usize },
    /// One sample `delay_samples` after each match
    Snapshot { delay_samples: usize },
    /// From a match up to the next non-match, at most `max_window` samples (0 = unbounded)
    Multiplexed { max_window: usize },
}

struct WindowState {
    /// Retained samples; `history[0]` has absolute index `history_start`
    history: VecDeque<f64>,
    history_start: u64,
    /// Absolute index of the next sample to arrive
    next_index: u64,
    /// Matches waiting for enough samples: (absolute index, tag)
    pending: Vec<(u64, Tag)>,
    /// Open multiplexed window: (absolute start, opening tag)
    open: Option<(u64, Tag)>,
    dropped: u64,
}

impl WindowState {
    fn slice(&self, start: u64, end: u64) -> Vec<f64> {
        let from = start.saturating_sub(self.history_start) as usize;
        let to = end.saturating_sub(self.history_start) as usize;
        self.history
            .iter()
            .skip(from)
            .take(to.saturating_sub(from))
            .copied()
            .collect()
    }

    fn discard_before(&mut self, index: u64) {
        let index = index.min(self.next_index);
        if index > self.history_start {
            let n = ((index - self.history_start) as usize).min(self.history.len());
            self.history.drain(..n);
            self.history_start += n as u64;
        }
    }

    /// Discard the oldest samples beyond `capacity`; returns how many went
    fn enforce_capacity(&mut self, capacity: usize) -> usize {
        let excess = self.history.len().saturating_sub(capacity);
        if excess > 0 {
            self.history.drain(..excess);
            self.history_start += excess as u64;
            self.dropped += excess as u64;
            let start = self.history_start;
            // a match whose sample is gone can no longer be windowed
            self.pending.retain(|(at, _)| *at >= start);
        }
        excess
    }
}

struct WindowedTap {
    kind: WindowKind,
    predicate: Arc<dyn TriggerPredicate>,
    state: Mutex<WindowState>,
    history_capacity: usize,
    queue: DataSetQueue,
}

impl WindowedTap {
    fn new(
        kind: WindowKind,
        predicate: Arc<dyn TriggerPredicate>,
        history_capacity: usize,
        capacity: usize,
        finished: bool,
    ) -> Self {
        Self {
            kind,
            predicate,
            state: Mutex::new(WindowState {
                history: VecDeque::new(),
                history_start: 0,
                next_index: 0,
                pending: Vec::new(),
                open: None,
                dropped: 0,
            }),
            history_capacity,
            queue: DataSetQueue::new(capacity, finished),
        }
    }

    fn push(&self, samples: &[f64], tags: &[Tag], meta: &SinkMeta) {
        let mut state = lock(&self.state);
        let base = state.next_index;
        state.history.extend(samples.iter().copied());
        state.next_index += samples.len() as u64;

        let mut ordered: Vec<&Tag> = tags.iter().collect();
        ordered.sort_by_key(|t| t.index);

        match self.kind {
            WindowKind::Trigger { pre, post } => {
                for tag in ordered {
                    if self.predicate.evaluate(tag) == MatchResult::Matching {
                        state.pending.push((base + tag.index as u64, tag.clone()));
                    }
                }
                let next = state.next_index;
                let (ready, waiting): (Vec<_>, Vec<_>) = state
                    .pending
                    .drain(..)
                    .partition(|(at, _)| at + post as u64 <= next);
                state.pending = waiting;
                for (at, tag) in ready {
                    let start = at.saturating_sub(pre as u64).max(state.history_start);
                    let values = state.slice(start, at + post as u64);
                    self.emit(values, tag.at((at - start) as usize), meta);
                }
                let keep_from = state
                    .pending
                    .iter()
                    .map(|(at, _)| *at)
                    .chain(std::iter::once(next))
                    .min()
                    .unwrap_or(next)
                    .saturating_sub(pre as u64);
                state.discard_before(keep_from);
            }
            WindowKind::Snapshot { delay_samples } => {
                for tag in ordered {
                    if self.predicate.evaluate(tag) == MatchResult::Matching {
                        state
                            .pending
                            .push((base + tag.index as u64 + delay_samples as u64, tag.clone()));
                    }
                }
                let next = state.next_index;
                let (ready, waiting): (Vec<_>, Vec<_>) =
                    state.pending.drain(..).partition(|(at, _)| *at < next);
                state.pending = waiting;
                for (at, tag) in ready {
                    let values = state.slice(at, at + 1);
                    if values.is_empty() {
                        continue;
                    }
                    self.emit(values, tag.at(0), meta);
                }
                let keep_from = state
                    .pending
                    .iter()
                    .map(|(at, _)| *at)
                    .min()
                    .unwrap_or(next);
                state.discard_before(keep_from);
            }
            WindowKind::Multiplexed { max_window } => {
                for tag in ordered {
                    let at = base + tag.index as u64;
                    self.close_if_full(&mut state, max_window, at, meta);
                    match self.predicate.evaluate(tag) {
                        MatchResult::Matching if state.open.is_none() => {
                            state.open = Some((at, tag.clone()));
                        }
                        MatchResult::NotMatching => {
                            if let Some((start, open_tag)) = state.open.take() {
                                let values = state.slice(start, at);
                                self.emit(values, open_tag.at(0), meta);
                            }
                        }
                        _ => {}
                    }
                }
                let next = state.next_index;
                self.close_if_full(&mut state, max_window, next, meta);
                let keep_from = state.open.as_ref().map(|(start, _)| *start).unwrap_or(next);
                state.discard_before(keep_from);
            }
        }

        let excess = state.enforce_capacity(self.history_capacity);
        if excess > 0 {
            tracing::warn!(
                "Windowed tap history full, discarded {} samples ({} total)",
                excess,
                state.dropped
            );
        }
    }

    fn close_if_full(&self, state: &mut WindowState, max_window: usize, at: u64, meta: &SinkMeta) {
        if max_window == 0 {
            return;
        }
        if let Some((start, _)) = state.open {
            if at.saturating_sub(start) >= max_window as u64 {
                if let Some((start, open_tag)) = state.open.take() {
                    let values = state.slice(start, start + max_window as u64);
                    self.emit(values, open_tag.at(0), meta);
                }
            }
        }
    }

    fn emit(&self, values: Vec<f64>, event: Tag, meta: &SinkMeta) {
        let n = values.len();
        let signal_ranges = match (meta.signal_min, meta.signal_max) {
            (Some(min), Some(max)) => vec![vec![f64::from(min), f64::from(max)]],
            _ => Vec::new(),
        };
        self.queue.push(DataSet {
            signal_names: vec![meta.signal_name.clone()],
            signal_units: meta.signal_unit.iter().cloned().collect(),
            signal_ranges,
            extents: vec![1, n],
            signal_values: values,
            signal_errors: vec![0.0; n],
            timing_events: vec![vec![event]],
        });
    }
}

impl DataSetTap for WindowedTap {
    fn finished(&self) -> bool {
        self.queue.finished.load(Ordering::Acquire)
    }

    fn process_one(&self, f: &mut dyn FnMut(&DataSet)) -> bool {
        self.queue.process_one(f)
    }
}
