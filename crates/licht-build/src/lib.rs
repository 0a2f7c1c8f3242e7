//! The lighting build engine: barriered setup phases, a pull-based worker
//! pool with helper queues, and the drain pump that turns racy completion
//! order back into deterministic ascending-id export order.
//!
//! Entry point is [`run_build`]; everything else is exported for tests,
//! benches, and embedders that want the pieces separately.
#![forbid(unsafe_code)]

mod context;
pub mod kernels;
mod mapping;
mod orchestrator;
mod queues;
mod results;
mod scratch;
mod shared;
mod stats;
mod worker;

pub use context::BuildContext;
pub use orchestrator::{BuildReport, ExportCounts, PhaseTimings, run_build};
pub use queues::{GroupTicket, HelpGroup, IndexedClaim, IndexedTasks, OneShotFlag, SharedQueue};
pub use results::{ResultList, ResultRecord};
pub use scratch::{Scratch, ScratchPool};
pub use shared::{SetupTimings, SharedBuildState};
pub use stats::{BuildStats, StatsAggregator, WorkerStats};

/// A build fails only when a worker thread dies; everything else the
/// pipeline absorbs (rejections retry, cancellation is an orderly stop).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("worker {worker} faulted: {message}")]
    WorkerFault { worker: usize, message: String },
}
