//! Persistence layer: repository capabilities plus the two shipped SQL
//! dialects (server = Postgres through sqlx, embedded = SQLite through
//! rusqlite).

pub mod codec;
mod postgres;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DbBackend, DbConfig};
use crate::core::error::{Error, Result};
use crate::core::model::{
    Checkpoint, Diff, DiffArtifact, EventPayload, IdempotencyRecord, Lock, NewTask, Page, Policy,
    PolicyRules, Profile, ResolvedConfig, Run, RunEvent, RunFilter, RunPatch, RunPhase, RunStatus,
    RunnerType, Task, TaskStatus,
};

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

pub const SCHEMA_VERSION: i64 = 1;
pub const SCHEMA_LOCK: &str = "schema:init";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Server,
    Embedded,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Server => "server",
            Dialect::Embedded => "embedded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub key: String,
    pub runner_type: RunnerType,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub default_timeout_minutes: i64,
    pub requires_approval: bool,
}

/// Where the run's task comes from: an existing task or one inserted in the
/// same transaction as the run.
#[derive(Debug, Clone)]
pub enum TaskSource {
    Existing(Uuid),
    New(NewTask),
}

#[derive(Debug, Clone)]
pub struct IdempotencyClaim {
    pub key: String,
    pub fingerprint: String,
    pub ttl: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub task: TaskSource,
    pub profile_id: Option<Uuid>,
    pub runner_type: RunnerType,
    pub resolved_config: ResolvedConfig,
    pub requires_approval: bool,
    pub timeout_ms: i64,
    pub attempt: i32,
    pub parent_run_id: Option<Uuid>,
    pub idempotency: Option<IdempotencyClaim>,
}

#[derive(Debug, Clone)]
pub enum CreateRunOutcome {
    Created { run: Run, task: Task },
    /// The idempotency key was already bound to this run with a matching
    /// fingerprint; nothing was written.
    Existing { run: Run },
}

impl CreateRunOutcome {
    pub fn run(&self) -> &Run {
        match self {
            CreateRunOutcome::Created { run, .. } | CreateRunOutcome::Existing { run } => run,
        }
    }
}

/// Conditional status/phase update. Applied only when the run's current
/// status is one of `from`; the events are appended in the same transaction.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub run_id: Uuid,
    pub from: Vec<RunStatus>,
    pub to_status: RunStatus,
    pub to_phase: RunPhase,
    pub patch: RunPatch,
    pub events: Vec<EventPayload>,
    /// Overrides the task status otherwise mirrored from `to_status`.
    pub task_status: Option<TaskStatus>,
    /// Refuse with a conflict while the run sits in this phase.
    pub unless_phase: Option<RunPhase>,
}

impl RunTransition {
    pub fn new(run_id: Uuid, from: &[RunStatus], to_status: RunStatus, to_phase: RunPhase) -> Self {
        Self {
            run_id,
            from: from.to_vec(),
            to_status,
            to_phase,
            patch: RunPatch::default(),
            events: Vec::new(),
            task_status: None,
            unless_phase: None,
        }
    }

    pub fn patch(mut self, patch: RunPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn event(mut self, payload: EventPayload) -> Self {
        self.events.push(payload);
        self
    }

    pub fn task_status(mut self, status: TaskStatus) -> Self {
        self.task_status = Some(status);
        self
    }

    pub fn unless_phase(mut self, phase: RunPhase) -> Self {
        self.unless_phase = Some(phase);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub run: Run,
    pub events: Vec<RunEvent>,
}

/// Checks shared by both dialects once the current row is locked.
pub(crate) fn check_transition(current: &Run, t: &RunTransition) -> Result<()> {
    if !t.from.contains(&current.status) {
        return Err(Error::conflict(format!(
            "run {} is {}, expected one of [{}]",
            current.id,
            current.status,
            t.from
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    if t.unless_phase == Some(current.phase) {
        return Err(Error::conflict(format!(
            "run {} is in phase {}",
            current.id, current.phase
        )));
    }
    if !current.status.can_transition_to(t.to_status) {
        return Err(Error::conflict(format!(
            "illegal run transition {} -> {}",
            current.status, t.to_status
        )));
    }
    if t.to_phase < current.phase {
        return Err(Error::conflict(format!(
            "run phase cannot move back from {} to {}",
            current.phase, t.to_phase
        )));
    }
    Ok(())
}

/// Emission time for the next event: never earlier than the previous one,
/// so sequence order and time order agree. Kept at microsecond precision,
/// which both dialects store losslessly.
pub(crate) fn next_emitted_at(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match last {
        Some(last) if last >= now => last + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
pub trait ProfileRepo: Send + Sync {
    async fn create_profile(&self, new: NewProfile) -> Result<Profile>;
    async fn get_profile(&self, id: Uuid) -> Result<Profile>;
    async fn get_profile_by_key(&self, key: &str) -> Result<Option<Profile>>;
    /// Rejected with `conflict` while a non-terminal run references it.
    async fn update_profile(&self, profile: &Profile) -> Result<Profile>;
    async fn list_profiles(&self, page: Page) -> Result<Vec<Profile>>;
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn create_task(&self, new: NewTask) -> Result<Task>;
    async fn get_task(&self, id: Uuid) -> Result<Task>;
    async fn update_task(&self, task: &Task) -> Result<Task>;
    async fn list_tasks(&self, page: Page) -> Result<Vec<Task>>;
    /// Admin path. Removes the task and everything hanging off its runs.
    async fn delete_task(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn create_run(&self, new: NewRun) -> Result<CreateRunOutcome>;
    async fn get_run(&self, id: Uuid) -> Result<Run>;
    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<Run>>;
    async fn transition_run(&self, transition: RunTransition) -> Result<TransitionOutcome>;
    /// Pending runs in FIFO order: `created_at`, then id.
    async fn next_pending_runs(&self, limit: i64) -> Result<Vec<Run>>;
    async fn count_runs(&self, status: RunStatus) -> Result<i64>;
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn append_event(&self, run_id: Uuid, payload: EventPayload) -> Result<RunEvent>;
    async fn list_events(&self, run_id: Uuid, after_seq: Option<i64>, page: Page)
    -> Result<Vec<RunEvent>>;
}

#[async_trait]
pub trait CheckpointRepo: Send + Sync {
    /// Upsert by `(run_id, label)` and append `checkpoint_saved`.
    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        label: &str,
        snapshot: serde_json::Value,
    ) -> Result<Checkpoint>;
    async fn get_checkpoint(&self, run_id: Uuid, label: &str) -> Result<Option<Checkpoint>>;
    async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>>;
}

/// Result of binding an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Bound(IdempotencyRecord),
    Existing(IdempotencyRecord),
    Mismatch(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyRepo: Send + Sync {
    async fn bind_or_return(
        &self,
        key: &str,
        fingerprint: &str,
        run_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<Binding>;
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait PolicyRepo: Send + Sync {
    async fn upsert_policy(&self, key: &str, rules: &PolicyRules) -> Result<Policy>;
    async fn get_policy(&self, key: &str) -> Result<Option<Policy>>;
    async fn list_policies(&self, page: Page) -> Result<Vec<Policy>>;
}

#[async_trait]
pub trait LockRepo: Send + Sync {
    /// `None` when another holder owns an unexpired lock. Re-acquiring by the
    /// same holder refreshes the expiry.
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lock>>;
    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool>;
    /// Delete the lock if it has expired.
    async fn try_reclaim_lock(&self, name: &str) -> Result<bool>;
    async fn get_lock(&self, name: &str) -> Result<Option<Lock>>;
}

#[async_trait]
pub trait DiffRepo: Send + Sync {
    async fn save_diff(&self, run_id: Uuid, sandbox_id: &str, diff: &Diff) -> Result<DiffArtifact>;
    async fn latest_diff(&self, run_id: Uuid) -> Result<Option<DiffArtifact>>;
}

#[async_trait]
pub trait Store:
    ProfileRepo
    + TaskRepo
    + RunRepo
    + EventRepo
    + CheckpointRepo
    + IdempotencyRepo
    + PolicyRepo
    + LockRepo
    + DiffRepo
{
    fn dialect(&self) -> Dialect;
    async fn health_check(&self) -> Result<()>;
    async fn close(&self);
}

pub type SharedStore = Arc<dyn Store>;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_db_config(cfg: &DbConfig) -> Self {
        Self {
            attempts: cfg.max_retries.max(1),
            base: Duration::from_millis(cfg.base_retry_delay_ms),
            max: Duration::from_millis(cfg.max_retry_delay_ms),
            jitter: cfg.retry_jitter_factor,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`, then spread by +/- `jitter`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);
        if self.jitter <= 0.0 {
            return exp;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let factor = (1.0 + spread).max(0.0);
        exp.mul_f64(factor).min(self.max)
    }
}

/// Retry `op` while it fails with a transient error.
pub async fn retry_transient<T, F, Fut>(label: &str, backoff: Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < backoff.attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    "{} failed with transient error (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    backoff.attempts,
                    delay,
                    e.detail()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open the configured dialect, retrying transient failures, and bootstrap
/// the schema.
pub async fn connect(cfg: &DbConfig) -> Result<SharedStore> {
    let backend = cfg
        .backend()
        .map_err(|e| Error::invalid_args(format!("invalid configuration: {}", e)))?;
    let backoff = Backoff::from_db_config(cfg);

    let store: SharedStore = match backend {
        DbBackend::Embedded => {
            let path = cfg.embedded_path();
            let store = retry_transient("open embedded store", backoff, || {
                SqliteStore::open(&path)
            })
            .await?;
            info!("Embedded store ready at {}", path.display());
            Arc::new(store)
        }
        DbBackend::Server => {
            let store = retry_transient("connect server store", backoff, || {
                PgStore::connect(cfg)
            })
            .await?;
            info!("Server store connected");
            Arc::new(store)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests;
