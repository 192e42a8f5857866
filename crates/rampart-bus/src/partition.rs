//! One partition of a bus: its ring, the worker wakeup and the counters
//! the worker and the shutdown coordinator read.

use crate::ring::Ring;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// One ordered lane of a bus: a ring, the wakeup for its worker and the
/// worker's counters.
pub(crate) struct Partition<E> {
    pub(crate) index: usize,
    pub(crate) ring: Ring<E>,
    pub(crate) notify: Notify,
    busy: AtomicBool,
    producers: AtomicUsize,
    processed: AtomicU64,
    abandoned: AtomicU64,
}

/// Marks a submission in progress on one partition.
pub(crate) struct ProducerGuard<'a, E>(&'a Partition<E>);

impl<E> Drop for ProducerGuard<'_, E> {
    fn drop(&mut self) {
        self.0.producers.fetch_sub(1, Ordering::SeqCst);
        self.0.notify.notify_one();
    }
}

impl<E> Partition<E> {
    pub(crate) fn new(index: usize, ring: Ring<E>) -> Self {
        Self {
            index,
            ring,
            notify: Notify::new(),
            busy: AtomicBool::new(false),
            producers: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Queue an event and wake the worker.
    pub(crate) fn push(&self, event: E) -> Result<(), E> {
        self.ring.push(event)?;
        // notify_one stores a permit when the worker is not parked yet.
        self.notify.notify_one();
        Ok(())
    }

    /// Register a producer. Must be taken before the producer checks the
    /// bus phase, so a draining worker cannot exit under a pending push.
    pub(crate) fn enter(&self) -> ProducerGuard<'_, E> {
        self.producers.fetch_add(1, Ordering::SeqCst);
        ProducerGuard(self)
    }

    pub(crate) fn has_producers(&self) -> bool {
        self.producers.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub(crate) fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Drop everything still queued, counting it as abandoned.
    pub(crate) fn discard_queued(&self) -> u64 {
        let mut dropped = 0;
        while self.ring.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            self.mark_abandoned(dropped);
        }
        dropped
    }
}
