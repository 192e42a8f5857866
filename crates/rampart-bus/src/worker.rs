//! Partition worker threads.
//!
//! Each partition is drained by one OS thread running a current-thread
//! tokio runtime, so handlers can await while events of one partition stay
//! strictly sequential.

use crate::bus::{EventHandler, Phase};
use crate::partition::Partition;
use futures_util::FutureExt;
use rampart_telemetry::{events, MetricsRegistry};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;

pub(crate) struct WorkerContext<E, H: ?Sized> {
    pub(crate) bus: Arc<str>,
    pub(crate) partition: Arc<Partition<E>>,
    pub(crate) handler: Arc<H>,
    pub(crate) phase: watch::Receiver<Phase>,
    pub(crate) metrics: Arc<MetricsRegistry>,
}

/// Spawn the dedicated thread for one partition.
pub(crate) fn spawn<E, H>(ctx: WorkerContext<E, H>) -> std::io::Result<JoinHandle<()>>
where
    E: Send + 'static,
    H: EventHandler<E> + ?Sized + 'static,
{
    let name = format!("{}-{}", ctx.bus, ctx.partition.index);
    std::thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::error!(
                    bus = %ctx.bus,
                    partition = ctx.partition.index,
                    error = %error,
                    "failed to build worker runtime"
                );
                ctx.partition.discard_queued();
                return;
            }
        };
        runtime.block_on(run(ctx));
    })
}

async fn run<E, H>(mut ctx: WorkerContext<E, H>)
where
    E: Send + 'static,
    H: EventHandler<E> + ?Sized,
{
    let partition = Arc::clone(&ctx.partition);
    tracing::debug!(
        event = events::BUS_WORKER_STARTED,
        bus = %ctx.bus,
        partition = partition.index,
    );

    loop {
        let phase = *ctx.phase.borrow_and_update();
        if phase == Phase::Aborting {
            partition.discard_queued();
            break;
        }

        if let Some(event) = partition.ring.pop() {
            partition.set_busy(true);
            let handled = AssertUnwindSafe(ctx.handler.on_event(event)).catch_unwind();
            let aborted = tokio::select! {
                biased;
                _ = ctx.phase.wait_for(|p| *p == Phase::Aborting) => true,
                result = handled => {
                    if result.is_err() {
                        tracing::error!(
                            bus = %ctx.bus,
                            partition = partition.index,
                            "event handler panicked"
                        );
                    }
                    false
                }
            };
            partition.set_busy(false);

            if aborted {
                partition.mark_abandoned(1);
            } else {
                partition.mark_processed();
                ctx.metrics.record_processed(&ctx.bus);
            }
            continue;
        }

        if phase == Phase::Draining && !partition.has_producers() {
            // A producer may have pushed just before leaving.
            if partition.ring.is_empty() {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = partition.notify.notified() => {}
            changed = ctx.phase.changed() => {
                if changed.is_err() {
                    partition.discard_queued();
                    break;
                }
            }
        }
    }

    tracing::debug!(
        event = events::BUS_WORKER_STOPPED,
        bus = %ctx.bus,
        partition = partition.index,
        processed = partition.processed(),
        abandoned = partition.abandoned(),
    );
}
