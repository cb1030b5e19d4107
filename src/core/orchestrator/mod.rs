//! Run orchestration: creation with idempotency, the run state machine,
//! the worker pool and the approval gate.

mod approval;
mod executor;
pub mod idempotency;
pub mod policy;
pub mod runners;
mod scheduler;
mod service;
pub mod workspace;

pub use runners::{CommandRunner, RunContext, RunnerAdapter, RunnerHandle, RunnerRegistry};
pub use service::{
    ApproveRequest, ListRunsQuery, Orchestrator, OrchestratorSettings, RejectRequest, SpawnOutcome,
    SpawnRequest,
};
pub use workspace::Workspace;

#[cfg(test)]
pub(crate) mod tests;
