//! Minimal work scheduler.
//!
//! Chains of stages are registered under unique names, run in order on
//! Tokio tasks, gated by device constraints, and observed through
//! [`StatusStream`]s. [`WorkScheduler`] is the seam the orchestration
//! layer depends on; [`LocalScheduler`] is the in-process implementation.

mod chain;
mod device;
mod scheduler;
mod stream;

pub use chain::{ChainError, ChainSpec, ExistingWorkPolicy, StageSpec};
pub use device::DeviceMonitor;
pub use scheduler::LocalScheduler;
pub use stream::{Snapshot, StatusStream, WorkQuery};

use crate::model::ChainId;

pub trait WorkScheduler: Send + Sync {
    /// Validate and submit a chain. Never blocks on chain execution.
    fn enqueue(&self, chain: ChainSpec) -> Result<ChainId, ChainError>;

    /// Cancel whatever is live under `name`. A no-op when nothing is.
    fn cancel_unique(&self, name: &str);

    /// Subscribe to status snapshots for the stages matching `query`.
    fn subscribe(&self, query: WorkQuery) -> StatusStream;

    /// Point-in-time snapshot for `query`.
    fn snapshot(&self, query: &WorkQuery) -> Snapshot;
}
