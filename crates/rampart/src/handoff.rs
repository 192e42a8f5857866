//! Handed-off exchanges.
//!
//! A plugin waiting on a downstream call suspends the chain instead of
//! holding the request partition. The exchange and the plugin's future are
//! moved onto the gateway's runtime; when the future finishes, the result
//! is submitted to the response bus under the exchange's partition key.
//!
//! Handoffs form a shutdown stage between the request and the response
//! bus: the coordinator waits for them to finish, and a forced shutdown
//! drops the ones still running.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rampart_bus::{Drain, EventBus};
use rampart_chain::{Exchange, PluginChain, Suspended};
use rampart_telemetry::events;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::handlers::{deliver, ResponseEvent};

struct Counters {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    abandoned: AtomicU64,
}

/// Decrements the in-flight count when the task ends, however it ends.
struct InFlight(Arc<Counters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Handoffs {
    runtime: Handle,
    chain: Arc<PluginChain>,
    responses: Arc<EventBus<ResponseEvent>>,
    counters: Arc<Counters>,
    abort: watch::Sender<bool>,
}

impl Handoffs {
    pub fn new(
        runtime: Handle,
        chain: Arc<PluginChain>,
        responses: Arc<EventBus<ResponseEvent>>,
    ) -> Self {
        Self {
            runtime,
            chain,
            responses,
            counters: Arc::new(Counters {
                in_flight: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
            abort: watch::Sender::new(false),
        }
    }

    /// Run a suspended exchange to completion off the partition worker.
    pub fn spawn(&self, key: u64, mut exchange: Exchange, suspended: Suspended) {
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.counters));
        let chain = Arc::clone(&self.chain);
        let responses = Arc::clone(&self.responses);
        let mut abort = self.abort.subscribe();

        self.runtime.spawn(async move {
            let counters = Arc::clone(&guard.0);
            let _guard = guard;
            let outcome = tokio::select! {
                biased;
                _ = abort.wait_for(|aborted| *aborted) => None,
                outcome = chain.resume(&mut exchange, suspended) => Some(outcome),
            };

            match outcome {
                Some(outcome) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    let kind = outcome.outcome();
                    deliver(&responses, key, exchange, outcome.into_response(), kind);
                }
                None => {
                    counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = events::HANDOFF_ABANDONED,
                        trace_id = %exchange.trace_id(),
                        "handoff dropped by shutdown"
                    );
                }
            }
        });
    }

    /// Handoffs still running.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }
}

impl Drain for Handoffs {
    fn name(&self) -> &str {
        "handoff"
    }

    // New handoffs only come from request workers, which are drained by
    // the time this stage is closed.
    fn close(&self) {}

    fn abort(&self) {
        self.abort.send_replace(true);
    }

    fn is_drained(&self) -> bool {
        self.in_flight() == 0
    }

    fn live_partitions(&self) -> Vec<usize> {
        Vec::new()
    }

    fn abandoned(&self) -> u64 {
        self.counters.abandoned.load(Ordering::Relaxed)
    }

    fn reap(&self) {}
}
