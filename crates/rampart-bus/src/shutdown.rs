//! Ordered graceful shutdown across buses.
//!
//! Stages are closed and drained one after another against a single
//! deadline. When the deadline passes, every stage is aborted and given a
//! short grace period for its threads to exit. The grace period is carved
//! out of the caller's timeout, so a report is always ready by then.

use crate::bus::EventBus;
use rampart_telemetry::events;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Something the coordinator can close, drain and abort.
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;
    fn close(&self);
    fn abort(&self);
    fn is_drained(&self) -> bool;
    fn live_partitions(&self) -> Vec<usize>;
    fn abandoned(&self) -> u64;
    fn reap(&self);
}

impl<E: Send + 'static> Drain for EventBus<E> {
    fn name(&self) -> &str {
        EventBus::name(self)
    }

    fn close(&self) {
        EventBus::close(self);
    }

    fn abort(&self) {
        EventBus::abort(self);
    }

    fn is_drained(&self) -> bool {
        EventBus::is_drained(self)
    }

    fn live_partitions(&self) -> Vec<usize> {
        EventBus::live_partitions(self)
    }

    fn abandoned(&self) -> u64 {
        EventBus::abandoned(self)
    }

    fn reap(&self) {
        EventBus::reap(self);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued event was handled.
    Drained,
    /// The deadline passed; remaining events were dropped.
    Forced { abandoned: u64 },
    /// Some workers did not exit even after being aborted.
    TimedOut { stuck_partitions: Vec<(String, usize)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub drained: bool,
    pub abandoned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.outcome == ShutdownOutcome::Drained
    }
}

pub struct ShutdownCoordinator {
    stages: Vec<Arc<dyn Drain>>,
    join_grace: Duration,
    report: Mutex<Option<ShutdownReport>>,
}

impl ShutdownCoordinator {
    /// Stages are drained in the order given.
    pub fn new(stages: Vec<Arc<dyn Drain>>) -> Self {
        Self {
            stages,
            join_grace: Duration::from_millis(500),
            report: Mutex::new(None),
        }
    }

    /// How long aborted workers get to exit before they are reported stuck.
    /// At most half of the shutdown timeout is used for it.
    pub fn with_join_grace(mut self, join_grace: Duration) -> Self {
        self.join_grace = join_grace;
        self
    }

    /// Whether shutdown has completed.
    pub fn is_complete(&self) -> bool {
        self.report.try_lock().is_ok_and(|r| r.is_some())
    }

    /// Shut every stage down. Later and concurrent calls wait for the first
    /// one and return its report.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut report = self.report.lock().await;
        if let Some(done) = report.as_ref() {
            return done.clone();
        }

        let started = Instant::now();
        let join_grace = self.join_grace.min(timeout / 2);
        let deadline = started + timeout.saturating_sub(join_grace);
        let mut in_time = true;

        for stage in &self.stages {
            stage.close();
            if !wait_drained(stage.as_ref(), deadline).await {
                tracing::warn!(stage = stage.name(), "stage did not drain before the deadline");
                in_time = false;
                break;
            }
        }

        let outcome = if in_time {
            ShutdownOutcome::Drained
        } else {
            for stage in &self.stages {
                stage.abort();
            }
            let grace = Instant::now() + join_grace;
            for stage in &self.stages {
                wait_drained(stage.as_ref(), grace).await;
            }

            let stuck: Vec<(String, usize)> = self
                .stages
                .iter()
                .flat_map(|s| {
                    s.live_partitions()
                        .into_iter()
                        .map(|p| (s.name().to_string(), p))
                })
                .collect();
            if stuck.is_empty() {
                ShutdownOutcome::Forced {
                    abandoned: self.stages.iter().map(|s| s.abandoned()).sum(),
                }
            } else {
                ShutdownOutcome::TimedOut {
                    stuck_partitions: stuck,
                }
            }
        };

        let stages = self
            .stages
            .iter()
            .map(|s| {
                s.reap();
                StageReport {
                    name: s.name().to_string(),
                    drained: s.is_drained(),
                    abandoned: s.abandoned(),
                }
            })
            .collect();

        let done = ShutdownReport {
            outcome,
            stages,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            event = events::SHUTDOWN_COMPLETE,
            outcome = ?done.outcome,
            elapsed_ms = done.elapsed.as_millis() as u64,
        );
        *report = Some(done.clone());
        done
    }
}

async fn wait_drained(stage: &dyn Drain, deadline: Instant) -> bool {
    loop {
        if stage.is_drained() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
