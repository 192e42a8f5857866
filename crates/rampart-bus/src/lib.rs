//! Event bus and shutdown coordination for the Rampart gateway.
//!
//! A bus is a fixed set of partitions. Each partition is a bounded ring
//! buffer drained by one dedicated thread, so events submitted under the
//! same key are handled strictly in order while different keys spread
//! across threads.

pub mod bus;
mod partition;
pub mod ring;
pub mod shutdown;
mod worker;

pub use bus::{partition_index, BusConfig, BusError, BusStats, EventBus, EventHandler, SubmitError};
pub use ring::Ring;
pub use shutdown::{Drain, ShutdownCoordinator, ShutdownOutcome, ShutdownReport, StageReport};
