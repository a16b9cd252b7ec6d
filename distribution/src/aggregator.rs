//! Write-coalescing queue for client status events.
//!
//! Request handlers enqueue events; a background worker drains the queue on
//! an interval, or as soon as it reaches its size threshold, and writes the
//! net change per release in a single bulk upsert.
use crate::metrics_defs::{
    AGGREGATOR_FLUSH_DURATION, AGGREGATOR_FLUSH_EVENTS, AGGREGATOR_QUEUE_SIZE, AGGREGATOR_REQUEUED,
    AGGREGATOR_UNKNOWN_RELEASE,
};
use crate::store::{MetricsStore, StoreError};
use crate::types::{MetricCounter, MetricDelta, ReleaseId};
use parking_lot::Mutex;
use shared::{counter, gauge, histogram};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub deployment_key: String,
    pub label: String,
    pub counter: MetricCounter,
    pub delta: i64,
}

impl MetricEvent {
    pub fn new(deployment_key: &str, label: &str, counter: MetricCounter, delta: i64) -> Self {
        MetricEvent {
            deployment_key: deployment_key.to_string(),
            label: label.to_string(),
            counter,
            delta,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AggregatorError {
    #[error("flush failed: {0}")]
    Store(#[from] StoreError),

    #[error("the aggregator has been shut down")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    // Flush now. Replies with the number of events written.
    Flush(oneshot::Sender<Result<usize, AggregatorError>>),
    // Flush whatever is left and stop the worker.
    Shutdown(oneshot::Sender<()>),
}

struct Queue {
    events: Mutex<VecDeque<MetricEvent>>,
    // Wakes the worker once the queue reaches `max_size`.
    full: Notify,
    max_size: usize,
}

struct AggregatorInner {
    queue: Arc<Queue>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<AggregatorInner>,
}

impl MetricsAggregator {
    /// Starts the flush worker. Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn MetricsStore>, flush_interval: Duration, max_queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(16);

        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::new()),
            full: Notify::new(),
            max_size: max_queue_size,
        });

        let worker = Worker {
            queue: queue.clone(),
            store,
        };
        let handle = tokio::spawn(worker.run(rx, flush_interval));

        MetricsAggregator {
            inner: Arc::new(AggregatorInner {
                queue,
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn enqueue(&self, event: MetricEvent) {
        self.enqueue_all([event]);
    }

    /// Appends all events under one lock acquisition, so a flush sees either
    /// all of them or none.
    pub fn enqueue_all(&self, events: impl IntoIterator<Item = MetricEvent>) {
        let len = {
            let mut queue = self.inner.queue.events.lock();
            queue.extend(events);
            queue.len()
        };

        if len >= self.inner.queue.max_size {
            self.inner.queue.full.notify_one();
        }
    }

    pub fn record_download(&self, deployment_key: &str, label: &str) {
        self.enqueue(MetricEvent::new(
            deployment_key,
            label,
            MetricCounter::Downloaded,
            1,
        ));
    }

    /// A client switched to `label`. The release it ran before, if it was an
    /// update rather than the binary's bundle, loses an active install.
    pub fn record_update(&self, deployment_key: &str, label: &str, previous: Option<(&str, &str)>) {
        let mut events = vec![
            MetricEvent::new(deployment_key, label, MetricCounter::Active, 1),
            MetricEvent::new(deployment_key, label, MetricCounter::Installed, 1),
        ];
        if let Some((previous_key, previous_label)) = previous {
            events.push(MetricEvent::new(
                previous_key,
                previous_label,
                MetricCounter::Active,
                -1,
            ));
        }
        self.enqueue_all(events);
    }

    pub fn record_failure(&self, deployment_key: &str, label: &str) {
        self.enqueue(MetricEvent::new(deployment_key, label, MetricCounter::Failed, 1));
    }

    /// Events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.queue.events.lock().len()
    }

    /// Flushes immediately and waits for the result.
    pub async fn flush(&self) -> Result<usize, AggregatorError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| AggregatorError::Stopped)?;
        rx.await.map_err(|_| AggregatorError::Stopped)?
    }

    /// Writes out the remaining events and stops the worker. Events that
    /// cannot be written are logged and dropped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "metrics aggregator worker panicked");
        }
    }
}

struct Worker {
    queue: Arc<Queue>,
    store: Arc<dyn MetricsStore>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Command>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        // After a failed flush, a full queue waits for the next tick instead
        // of retrying on every enqueue.
        let mut backing_off = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    backing_off = self.flush().await.is_err();
                }
                _ = self.queue.full.notified(), if !backing_off => {
                    backing_off = self.flush().await.is_err();
                    ticker.reset();
                }
                command = rx.recv() => {
                    match command {
                        Some(Command::Flush(reply)) => {
                            let result = self.flush().await;
                            backing_off = result.is_err();
                            let _ = reply.send(result.map_err(Into::into));
                        }
                        Some(Command::Shutdown(reply)) => {
                            self.final_flush().await;
                            let _ = reply.send(());
                            return;
                        }
                        // Every handle is gone.
                        None => {
                            self.final_flush().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn final_flush(&self) {
        if self.flush().await.is_err() {
            let dropped = self.queue.events.lock().len();
            tracing::warn!(dropped, "dropping metric events at shutdown");
        }
    }

    /// Drains the queue and writes it out. On failure the batch goes back to
    /// the front of the queue, ahead of anything enqueued meanwhile.
    async fn flush(&self) -> Result<usize, StoreError> {
        // The lock is released before any I/O.
        let batch: Vec<MetricEvent> = self.queue.events.lock().drain(..).collect();
        if batch.is_empty() {
            gauge!(AGGREGATOR_QUEUE_SIZE).set(0.0);
            return Ok(0);
        }

        let start = Instant::now();
        let result = apply_batch(self.store.as_ref(), &batch).await;
        histogram!(AGGREGATOR_FLUSH_DURATION).record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                histogram!(AGGREGATOR_FLUSH_EVENTS).record(batch.len() as f64);
                gauge!(AGGREGATOR_QUEUE_SIZE).set(self.queue.events.lock().len() as f64);
                tracing::debug!(events = batch.len(), "flushed metric events");
                Ok(batch.len())
            }
            Err(err) => {
                let requeued = batch.len();
                let pending = {
                    let mut queue = self.queue.events.lock();
                    for event in batch.into_iter().rev() {
                        queue.push_front(event);
                    }
                    queue.len()
                };
                counter!(AGGREGATOR_REQUEUED).increment(requeued as u64);
                gauge!(AGGREGATOR_QUEUE_SIZE).set(pending as f64);
                tracing::warn!(error = %err, requeued, "metric flush failed, requeued batch");
                Err(err)
            }
        }
    }
}

/// Resolves each `(deployment key, label)` once, nets the deltas per release
/// and counter, and writes them in one call.
async fn apply_batch(store: &dyn MetricsStore, batch: &[MetricEvent]) -> Result<(), StoreError> {
    let mut release_ids: HashMap<(&str, &str), Option<ReleaseId>> = HashMap::new();
    for event in batch {
        let group = (event.deployment_key.as_str(), event.label.as_str());
        if !release_ids.contains_key(&group) {
            let release_id = store.find_release_id(group.0, group.1).await?;
            release_ids.insert(group, release_id);
        }
    }

    let mut deltas: BTreeMap<ReleaseId, MetricDelta> = BTreeMap::new();
    let mut unknown = 0u64;
    for event in batch {
        let group = (event.deployment_key.as_str(), event.label.as_str());
        match release_ids.get(&group).copied().flatten() {
            Some(release_id) => deltas
                .entry(release_id)
                .or_insert_with(|| MetricDelta::new(release_id))
                .add(event.counter, event.delta),
            None => unknown += 1,
        }
    }

    if unknown > 0 {
        counter!(AGGREGATOR_UNKNOWN_RELEASE).increment(unknown);
        tracing::warn!(events = unknown, "dropping metric events for unknown releases");
    }

    let deltas: Vec<MetricDelta> = deltas.into_values().filter(|d| !d.is_zero()).collect();
    if deltas.is_empty() {
        return Ok(());
    }
    store.apply_metric_deltas(&deltas).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    #[derive(Default)]
    struct RecordingStore {
        lookups: Mutex<Vec<(String, String)>>,
        applied: Mutex<Vec<Vec<MetricDelta>>>,
        fail_next: AtomicBool,
        unavailable: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MetricsStore for RecordingStore {
        async fn find_release_id(
            &self,
            deployment_key: &str,
            label: &str,
        ) -> Result<Option<ReleaseId>, StoreError> {
            self.lookups
                .lock()
                .push((deployment_key.to_string(), label.to_string()));
            Ok(match (deployment_key, label) {
                ("key-a", "v1") => Some(1),
                ("key-a", "v2") => Some(2),
                ("key-b", "v1") => Some(3),
                _ => None,
            })
        }

        async fn apply_metric_deltas(&self, deltas: &[MetricDelta]) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst)
                || self.unavailable.load(Ordering::SeqCst)
            {
                return Err(StoreError::Backend("unavailable".into()));
            }
            self.applied.lock().push(deltas.to_vec());
            Ok(())
        }
    }

    impl RecordingStore {
        fn applied(&self) -> Vec<Vec<MetricDelta>> {
            self.applied.lock().clone()
        }
    }

    async fn wait_for_apply(store: &RecordingStore) {
        for _ in 0..100 {
            if !store.applied().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no flush happened");
    }

    #[tokio::test]
    async fn downloads_coalesce_into_one_upsert_per_release() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 1000);

        for _ in 0..3 {
            aggregator.record_download("key-a", "v1");
        }
        for _ in 0..2 {
            aggregator.record_download("key-a", "v2");
        }

        assert_eq!(aggregator.flush().await.unwrap(), 5);
        assert_eq!(store.lookups.lock().len(), 2);

        let applied = store.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            applied[0],
            vec![
                MetricDelta {
                    downloaded: 3,
                    ..MetricDelta::new(1)
                },
                MetricDelta {
                    downloaded: 2,
                    ..MetricDelta::new(2)
                },
            ]
        );
        assert_eq!(aggregator.pending(), 0);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn update_nets_active_counts() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 1000);

        aggregator.record_update("key-a", "v2", Some(("key-a", "v1")));
        aggregator.record_update("key-a", "v2", None);
        aggregator.record_failure("key-b", "v1");
        assert_eq!(aggregator.pending(), 6);

        aggregator.flush().await.unwrap();
        let applied = store.applied();
        assert_eq!(
            applied[0],
            vec![
                MetricDelta {
                    active: -1,
                    ..MetricDelta::new(1)
                },
                MetricDelta {
                    active: 2,
                    installed: 2,
                    ..MetricDelta::new(2)
                },
                MetricDelta {
                    failed: 1,
                    ..MetricDelta::new(3)
                },
            ]
        );
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_releases_and_zero_nets_are_dropped() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 1000);

        aggregator.record_download("key-a", "v404");
        aggregator.enqueue(MetricEvent::new("key-a", "v1", MetricCounter::Active, 1));
        aggregator.enqueue(MetricEvent::new("key-a", "v1", MetricCounter::Active, -1));

        aggregator.flush().await.unwrap();
        assert!(store.applied().is_empty());
        assert_eq!(aggregator.pending(), 0);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_flush_requeues_at_the_front() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 1000);

        aggregator.record_download("key-a", "v1");
        aggregator.record_download("key-a", "v2");
        store.fail_next.store(true, Ordering::SeqCst);

        assert!(matches!(
            aggregator.flush().await,
            Err(AggregatorError::Store(_))
        ));
        assert_eq!(aggregator.pending(), 2);

        aggregator.record_download("key-b", "v1");
        {
            let queue = aggregator.inner.queue.events.lock();
            let labels: Vec<(&str, &str)> = queue
                .iter()
                .map(|e| (e.deployment_key.as_str(), e.label.as_str()))
                .collect();
            assert_eq!(labels, [("key-a", "v1"), ("key-a", "v2"), ("key-b", "v1")]);
        }

        assert_eq!(aggregator.flush().await.unwrap(), 3);
        assert_eq!(store.applied()[0].len(), 3);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn threshold_triggers_flush() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 3);

        for _ in 0..3 {
            aggregator.record_download("key-a", "v1");
        }
        wait_for_apply(&store).await;
        assert_eq!(store.applied()[0][0].downloaded, 3);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_threshold_flush_waits_for_the_interval() {
        let store = Arc::new(RecordingStore::default());
        store.unavailable.store(true, Ordering::SeqCst);
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 3);

        for _ in 0..3 {
            aggregator.record_download("key-a", "v1");
        }
        for _ in 0..100 {
            if store.attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            aggregator.record_download("key-a", "v1");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.pending(), 6);

        store.unavailable.store(false, Ordering::SeqCst);
        assert_eq!(aggregator.flush().await.unwrap(), 6);
        assert_eq!(store.applied()[0][0].downloaded, 6);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn interval_triggers_flush() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), Duration::from_millis(20), 1000);

        aggregator.record_download("key-a", "v1");
        wait_for_apply(&store).await;
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_and_stops() {
        let store = Arc::new(RecordingStore::default());
        let aggregator = MetricsAggregator::new(store.clone(), HOUR, 1000);

        aggregator.record_download("key-a", "v1");
        aggregator.shutdown().await;
        assert_eq!(store.applied().len(), 1);

        assert!(matches!(
            aggregator.flush().await,
            Err(AggregatorError::Stopped)
        ));
    }
}
