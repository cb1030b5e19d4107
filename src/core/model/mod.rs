mod diff;
mod event;
mod profile;
mod records;
mod run;
mod task;

pub use diff::{ApproveResult, ChangeType, Diff, DiffArtifact, DiffStats, FileChange};
pub use event::{EventPayload, EventType, RunEvent};
pub use profile::{Policy, PolicyRules, Profile};
pub use records::{Checkpoint, DEFAULT_PAGE_LIMIT, IdempotencyRecord, Lock, MAX_PAGE_LIMIT, Page};
pub use run::{
    ResolvedConfig, Run, RunFilter, RunPatch, RunPhase, RunStatus, RunSummary, RunnerType,
};
pub use task::{ContextAttachment, NewTask, Task, TaskStatus};
