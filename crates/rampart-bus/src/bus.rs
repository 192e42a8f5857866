//! Partitioned event bus.

use crate::partition::Partition;
use crate::ring::Ring;
use crate::worker::{self, WorkerContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use rampart_telemetry::{log_bus_overloaded, MetricsRegistry, SubmitResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Spins before a blocked producer starts yielding its thread.
const SPIN_LIMIT: u32 = 64;

/// Consumer side of a bus. One call at a time per partition.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn on_event(&self, event: E);
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Used in thread names, logs and metric labels.
    pub name: String,
    pub partitions: usize,
    /// Ring size per partition; must be a power of two.
    pub capacity: usize,
    /// How long `submit` keeps retrying a full ring.
    pub submit_wait: Duration,
}

impl BusConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 4,
            capacity: 1024,
            submit_wait: Duration::from_millis(5),
        }
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_submit_wait(mut self, submit_wait: Duration) -> Self {
        self.submit_wait = submit_wait;
        self
    }
}

/// Errors raised while starting a bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("partition capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("a bus needs at least one partition")]
    NoPartitions,

    #[error("failed to spawn worker thread for bus {bus}: {source}")]
    Spawn {
        bus: String,
        #[source]
        source: std::io::Error,
    },
}

/// A rejected submission. The event is handed back to the caller.
#[derive(Error)]
pub enum SubmitError<T> {
    #[error("bus partition is full")]
    Overloaded(T),

    #[error("bus is shutting down")]
    ShuttingDown(T),
}

impl<T> SubmitError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Overloaded(event) | Self::ShuttingDown(event) => event,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(self, Self::Overloaded(_))
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overloaded(_) => f.write_str("Overloaded(..)"),
            Self::ShuttingDown(_) => f.write_str("ShuttingDown(..)"),
        }
    }
}

/// Lifecycle of a bus, observed by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    /// No new submissions; workers exit once their ring is empty.
    Draining,
    /// Workers drop what is left and exit as soon as possible.
    Aborting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub name: String,
    pub partitions: usize,
    pub capacity: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub processed: u64,
    pub abandoned: u64,
    pub depths: Vec<usize>,
}

struct Worker {
    partition: usize,
    thread: JoinHandle<()>,
}

/// A fixed set of ordered partitions, each drained by its own thread.
pub struct EventBus<E> {
    name: Arc<str>,
    partitions: Vec<Arc<Partition<E>>>,
    workers: Mutex<Vec<Worker>>,
    phase: watch::Sender<Phase>,
    capacity: usize,
    submit_wait: Duration,
    metrics: Arc<MetricsRegistry>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Partition for a key: FNV-1a of its bytes modulo the partition count.
pub fn partition_index(key: &[u8], partitions: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    if partitions == 0 {
        return 0;
    }
    let hash = key
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME));
    (hash % partitions as u64) as usize
}

impl<E: Send + 'static> EventBus<E> {
    /// Build the partitions and spawn one worker thread per partition.
    pub fn start<H>(
        config: BusConfig,
        handler: Arc<H>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, BusError>
    where
        H: EventHandler<E> + ?Sized + 'static,
    {
        if config.partitions == 0 {
            return Err(BusError::NoPartitions);
        }
        let name: Arc<str> = Arc::from(config.name.as_str());
        let (phase, _) = watch::channel(Phase::Running);

        let mut partitions = Vec::with_capacity(config.partitions);
        for index in 0..config.partitions {
            let ring = Ring::new(config.capacity).ok_or(BusError::InvalidCapacity(config.capacity))?;
            partitions.push(Arc::new(Partition::new(index, ring)));
        }

        let bus = Self {
            name,
            partitions,
            workers: Mutex::new(Vec::with_capacity(config.partitions)),
            phase,
            capacity: config.capacity,
            submit_wait: config.submit_wait,
            metrics,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        };

        for partition in &bus.partitions {
            let ctx = WorkerContext {
                bus: Arc::clone(&bus.name),
                partition: Arc::clone(partition),
                handler: Arc::clone(&handler),
                phase: bus.phase.subscribe(),
                metrics: Arc::clone(&bus.metrics),
            };
            // Dropping `bus` on error aborts the workers already spawned.
            let thread = worker::spawn(ctx).map_err(|source| BusError::Spawn {
                bus: config.name.clone(),
                source,
            })?;
            bus.workers.lock().push(Worker {
                partition: partition.index,
                thread,
            });
        }

        tracing::info!(
            bus = %bus.name,
            partitions = bus.partitions.len(),
            capacity = bus.capacity,
            "event bus started"
        );
        Ok(bus)
    }

    /// Submit an event, retrying a full ring for up to the configured wait.
    pub fn submit(&self, key: impl AsRef<[u8]>, event: E) -> Result<(), SubmitError<E>> {
        self.submit_within(key.as_ref(), event, self.submit_wait)
    }

    /// Submit without waiting for room.
    pub fn try_submit(&self, key: impl AsRef<[u8]>, event: E) -> Result<(), SubmitError<E>> {
        self.submit_within(key.as_ref(), event, Duration::ZERO)
    }

    fn submit_within(&self, key: &[u8], mut event: E, wait: Duration) -> Result<(), SubmitError<E>> {
        let partition = &self.partitions[self.partition_for(key)];
        let _producer = partition.enter();
        let mut started: Option<Instant> = None;
        let mut spins = 0u32;

        loop {
            if !self.is_accepting() {
                return Err(self.reject(SubmitError::ShuttingDown(event)));
            }
            match partition.push(event) {
                Ok(()) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_submission(&self.name, SubmitResult::Accepted);
                    return Ok(());
                }
                Err(back) => event = back,
            }

            let since = *started.get_or_insert_with(Instant::now);
            if since.elapsed() >= wait {
                log_bus_overloaded!(
                    bus = %self.name,
                    partition = partition.index,
                    depth = partition.ring.len(),
                );
                return Err(self.reject(SubmitError::Overloaded(event)));
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn reject(&self, error: SubmitError<E>) -> SubmitError<E> {
        let result = match error {
            SubmitError::Overloaded(_) => SubmitResult::Overloaded,
            SubmitError::ShuttingDown(_) => SubmitResult::ShuttingDown,
        };
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_submission(&self.name, result);
        error
    }
}

impl<E> EventBus<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_for(&self, key: impl AsRef<[u8]>) -> usize {
        partition_index(key.as_ref(), self.partitions.len())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued events in one partition.
    pub fn depth(&self, partition: usize) -> usize {
        self.partitions.get(partition).map_or(0, |p| p.ring.len())
    }

    /// Whether the worker of `partition` is inside its handler.
    pub fn is_busy(&self, partition: usize) -> bool {
        self.partitions.get(partition).is_some_and(|p| p.is_busy())
    }

    pub fn is_accepting(&self) -> bool {
        *self.phase.borrow() == Phase::Running
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            name: self.name.to_string(),
            partitions: self.partitions.len(),
            capacity: self.capacity,
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            processed: self.partitions.iter().map(|p| p.processed()).sum(),
            abandoned: self.abandoned(),
            depths: self.partitions.iter().map(|p| p.ring.len()).collect(),
        }
    }

    /// Stop accepting submissions; workers finish what is queued, then exit.
    pub fn close(&self) {
        self.advance(Phase::Draining);
    }

    /// Stop accepting submissions and make workers drop queued and
    /// in-flight events.
    pub fn abort(&self) {
        self.advance(Phase::Aborting);
    }

    /// Whether every worker thread has exited.
    pub fn is_drained(&self) -> bool {
        self.workers.lock().iter().all(|w| w.thread.is_finished())
    }

    /// Partitions whose worker thread is still running.
    pub fn live_partitions(&self) -> Vec<usize> {
        self.workers
            .lock()
            .iter()
            .filter(|w| !w.thread.is_finished())
            .map(|w| w.partition)
            .collect()
    }

    /// Events dropped by aborting workers plus anything still queued.
    pub fn abandoned(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.abandoned() + p.ring.len() as u64)
            .sum()
    }

    /// Join the worker threads that have already exited.
    pub fn reap(&self) {
        let mut workers = self.workers.lock();
        let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|w| w.thread.is_finished());
        *workers = running;
        drop(workers);

        for worker in finished {
            if worker.thread.join().is_err() {
                tracing::error!(bus = %self.name, partition = worker.partition, "worker thread panicked");
            }
        }
    }

    fn advance(&self, to: Phase) {
        let changed = self.phase.send_if_modified(|phase| {
            let next = match (*phase, to) {
                (Phase::Running, next) => next,
                (Phase::Draining, Phase::Aborting) => Phase::Aborting,
                _ => return false,
            };
            *phase = next;
            true
        });
        if changed {
            tracing::debug!(bus = %self.name, phase = ?to, "event bus phase changed");
            for partition in &self.partitions {
                partition.notify.notify_one();
            }
        }
    }
}

impl<E> Drop for EventBus<E> {
    fn drop(&mut self) {
        self.abort();
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("partitions", &self.partitions.len())
            .field("capacity", &self.capacity)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    struct Recorder {
        seen: Mutex<Vec<(u32, u32)>>,
    }

    #[async_trait]
    impl EventHandler<(u32, u32)> for Recorder {
        async fn on_event(&self, event: (u32, u32)) {
            self.seen.lock().push(event);
        }
    }

    /// Blocks inside the handler until the gate is opened.
    struct Gated {
        open: AtomicBool,
        gate: Notify,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl EventHandler<u32> for Gated {
        async fn on_event(&self, event: u32) {
            while !self.open.load(Ordering::Acquire) {
                self.gate.notified().await;
            }
            self.seen.lock().push(event);
        }
    }

    struct Panicky {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl EventHandler<u32> for Panicky {
        async fn on_event(&self, event: u32) {
            if event == 0 {
                panic!("handler bug");
            }
            self.seen.lock().push(event);
        }
    }

    fn metrics() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new())
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_partition_index_is_stable() {
        // FNV-1a 64 of "a" is 0xaf63dc4c8601ec8c.
        assert_eq!(partition_index(b"a", 1 << 16), 0xec8c);
        assert_eq!(partition_index(b"", 7), (0xcbf2_9ce4_8422_2325u64 % 7) as usize);
        assert_eq!(partition_index(b"anything", 1), 0);
        assert_eq!(partition_index(b"conn-42", 8), partition_index(b"conn-42", 8));
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let mut used = [false; 8];
        for i in 0u64..256 {
            used[partition_index(&i.to_be_bytes(), 8)] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test]
    fn test_rejects_bad_config() {
        let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let err = EventBus::<(u32, u32)>::start(BusConfig::new("t").with_capacity(3), Arc::clone(&handler), metrics())
            .expect_err("capacity 3");
        assert!(matches!(err, BusError::InvalidCapacity(3)));

        let err = EventBus::<(u32, u32)>::start(BusConfig::new("t").with_partitions(0), handler, metrics())
            .expect_err("no partitions");
        assert!(matches!(err, BusError::NoPartitions));
    }

    #[test]
    fn test_same_key_is_processed_in_order() {
        let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let bus = EventBus::<(u32, u32)>::start(
            BusConfig::new("order").with_partitions(4).with_capacity(64),
            Arc::clone(&handler),
            metrics(),
        )
        .expect("bus");

        for key in 0u32..4 {
            for seq in 0u32..200 {
                let mut event = (key, seq);
                loop {
                    match bus.submit(key.to_be_bytes(), event) {
                        Ok(()) => break,
                        Err(e) => event = e.into_inner(),
                    }
                }
            }
        }

        wait_until(|| handler.seen.lock().len() == 800);
        let seen = handler.seen.lock();
        for key in 0u32..4 {
            let seqs: Vec<u32> = seen.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
            assert_eq!(seqs, (0..200).collect::<Vec<_>>());
        }
        assert_eq!(bus.stats().processed, 800);
    }

    #[test]
    fn test_full_partition_hands_event_back() {
        let handler = Arc::new(Gated {
            open: AtomicBool::new(false),
            gate: Notify::new(),
            seen: Mutex::new(Vec::new()),
        });
        let bus = EventBus::<u32>::start(
            BusConfig::new("full")
                .with_partitions(1)
                .with_capacity(2)
                .with_submit_wait(Duration::from_millis(2)),
            Arc::clone(&handler),
            metrics(),
        )
        .expect("bus");

        bus.try_submit(b"k", 1).expect("first");
        wait_until(|| bus.is_busy(0));
        bus.try_submit(b"k", 2).expect("second");
        bus.try_submit(b"k", 3).expect("third");

        match bus.submit(b"k", 4) {
            Err(SubmitError::Overloaded(event)) => assert_eq!(event, 4),
            other => panic!("expected overload, got {other:?}"),
        }
        assert_eq!(bus.depth(0), 2);
        assert_eq!(bus.stats().rejected, 1);

        handler.open.store(true, Ordering::Release);
        handler.gate.notify_one();
        wait_until(|| handler.seen.lock().len() == 3);
        assert_eq!(*handler.seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_closed_bus_rejects_with_payload() {
        let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let bus = EventBus::<(u32, u32)>::start(BusConfig::new("closed").with_partitions(1), handler, metrics())
            .expect("bus");
        bus.close();
        assert!(!bus.is_accepting());

        match bus.submit(b"k", (7, 7)) {
            Err(SubmitError::ShuttingDown(event)) => assert_eq!(event, (7, 7)),
            other => panic!("expected shutting down, got {other:?}"),
        }
        wait_until(|| bus.is_drained());
    }

    #[test]
    fn test_close_drains_queued_events() {
        let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let bus = EventBus::<(u32, u32)>::start(
            BusConfig::new("drain").with_partitions(2).with_capacity(128),
            Arc::clone(&handler),
            metrics(),
        )
        .expect("bus");

        for i in 0u32..100 {
            bus.try_submit(i.to_be_bytes(), (i, i)).expect("room");
        }
        bus.close();
        wait_until(|| bus.is_drained());
        bus.reap();

        assert_eq!(handler.seen.lock().len(), 100);
        assert_eq!(bus.abandoned(), 0);
        assert!(bus.live_partitions().is_empty());
    }

    #[test]
    fn test_handler_panic_keeps_worker_alive() {
        let handler = Arc::new(Panicky { seen: Mutex::new(Vec::new()) });
        let bus = EventBus::<u32>::start(BusConfig::new("panic").with_partitions(1), Arc::clone(&handler), metrics())
            .expect("bus");

        bus.try_submit(b"k", 0).expect("room");
        bus.try_submit(b"k", 1).expect("room");
        wait_until(|| handler.seen.lock().len() == 1);
        assert_eq!(*handler.seen.lock(), vec![1]);
        assert!(!bus.is_drained());
    }

    #[test]
    fn test_submissions_are_counted_in_metrics() {
        let registry = metrics();
        let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let bus = EventBus::<(u32, u32)>::start(
            BusConfig::new("counted").with_partitions(1),
            Arc::clone(&handler),
            Arc::clone(&registry),
        )
        .expect("bus");
        bus.try_submit(b"k", (1, 1)).expect("room");
        wait_until(|| handler.seen.lock().len() == 1);
        wait_until(|| bus.stats().processed == 1);

        let text = rampart_telemetry::prometheus::render_metrics(&registry);
        assert!(text.contains(r#"rampart_bus_submissions_total{bus="counted",result="accepted"} 1"#));
        assert!(text.contains(r#"rampart_bus_processed_total{bus="counted"} 1"#));
    }

    mod ordering {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn interleaved_keys_keep_per_key_order(
                keys in prop::collection::vec(0u32..6, 1..200),
                partitions in 1usize..5,
            ) {
                let handler = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
                let bus = EventBus::<(u32, u32)>::start(
                    BusConfig::new("interleaved").with_partitions(partitions).with_capacity(16),
                    Arc::clone(&handler),
                    metrics(),
                )
                .expect("bus");

                let mut submitted: Vec<(u32, u32)> = Vec::with_capacity(keys.len());
                for (seq, key) in keys.iter().copied().enumerate() {
                    let mut event = (key, seq as u32);
                    loop {
                        match bus.submit(key.to_be_bytes(), event) {
                            Ok(()) => break,
                            Err(e) => event = e.into_inner(),
                        }
                    }
                    submitted.push((key, seq as u32));
                }
                bus.close();
                wait_until(|| bus.is_drained());

                let seen = handler.seen.lock();
                prop_assert_eq!(seen.len(), submitted.len());
                for key in 0u32..6 {
                    let expected: Vec<u32> = submitted.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
                    let actual: Vec<u32> = seen.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
                    prop_assert_eq!(actual, expected);
                }
            }
        }
    }
}
