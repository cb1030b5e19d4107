use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::model::{
    Checkpoint, ContextAttachment, DiffArtifact, EventPayload, NewTask, Page, Policy, PolicyRules,
    Profile, Run, RunEvent, RunFilter, RunPatch, RunPhase, RunStatus, RunnerType, TaskStatus,
};
use crate::core::store::{
    Backoff, CreateRunOutcome, IdempotencyClaim, NewProfile, NewRun, RunTransition, SharedStore,
    TaskSource, retry_transient,
};

use super::idempotency::{fingerprint, normalize_key};
use super::policy::{self, DEFAULT_POLICY_KEY, ResolveDefaults, ResolveInput};
use super::runners::RunnerRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_runs: usize,
    pub default_timeout: Duration,
    pub default_requires_approval: bool,
    pub cancel_grace: Duration,
    pub idempotency_ttl: chrono::Duration,
    pub store_backoff: Backoff,
    pub scheduler_tick: Duration,
    pub lock_ttl: Duration,
    pub runner_allow_list: Vec<RunnerType>,
    pub default_root: PathBuf,
    pub sandbox_root: PathBuf,
    pub commit_on_apply: bool,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let rt = &cfg.runtime;
        Self {
            max_concurrent_runs: rt.max_concurrent_runs.max(1),
            default_timeout: Duration::from_secs(
                (rt.default_run_timeout_minutes.max(1) as u64).saturating_mul(60),
            ),
            default_requires_approval: rt.default_requires_approval,
            cancel_grace: rt.cancel_grace(),
            idempotency_ttl: chrono::Duration::hours(rt.idempotency_ttl_hours),
            store_backoff: Backoff {
                attempts: rt.store_retry_attempts + 1,
                base: Duration::from_millis(100),
                max: Duration::from_secs(2),
                jitter: 0.25,
            },
            scheduler_tick: rt.scheduler_tick(),
            lock_ttl: Duration::from_secs(rt.lock_ttl_seconds.max(1)),
            runner_allow_list: cfg.runner_allow_list(),
            default_root: cfg.workspace.default_root(),
            sandbox_root: cfg.workspace.sandbox_root(),
            commit_on_apply: cfg.workspace.commit_on_apply,
        }
    }
}

/// Input to [`Orchestrator::spawn`]. Serialized as-is for the idempotency
/// fingerprint, so only request fields belong here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpawnRequest {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_type: Option<RunnerType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextAttachment>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub run: Run,
    /// False when an idempotency key returned an earlier run.
    pub created: bool,
}

/// String-typed filters as they arrive from tools, HTTP and the CLI.
#[derive(Debug, Clone, Default)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub runner_type: Option<String>,
    pub task_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListRunsQuery {
    pub fn to_filter(&self) -> Result<RunFilter> {
        let mut filter = RunFilter {
            task_id: self.task_id,
            created_after: self.created_after,
            created_before: self.created_before,
            ..RunFilter::default()
        };
        if let Some(raw) = self.status.as_deref() {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                filter.statuses.push(part.parse()?);
            }
        }
        if let Some(raw) = self.runner_type.as_deref().filter(|r| !r.trim().is_empty()) {
            filter.runner_type = Some(raw.parse()?);
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone)]
pub struct ApproveRequest {
    pub run_id: Uuid,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct RejectRequest {
    pub run_id: Uuid,
    pub actor: String,
    pub reason: Option<String>,
}

/// The orchestration service: owns run creation, the state machine and the
/// worker pool that drives pending runs through their runners.
pub struct Orchestrator {
    pub(crate) store: SharedStore,
    pub(crate) runners: RunnerRegistry,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) instance_id: String,
    pub(crate) wake: Notify,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) active: Mutex<HashMap<Uuid, CancellationToken>>,
    pub(crate) apply_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<RunEvent>,
}

impl Orchestrator {
    pub fn new(store: SharedStore, runners: RunnerRegistry, settings: OrchestratorSettings) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            runners,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_runs)),
            settings,
            instance_id: format!("orchestrator-{}", Uuid::new_v4()),
            wake: Notify::new(),
            active: Mutex::new(HashMap::new()),
            apply_gates: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// Events committed by this process, as they happen. Readers replay
    /// from the store first; this only tells them something new exists.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Conditional transition with transient retries. Published to
    /// subscribers once committed.
    pub(crate) async fn transition(&self, transition: RunTransition) -> Result<Run> {
        let run_id = transition.run_id;
        let label = format!("transition run {}", run_id);
        let outcome = retry_transient(&label, self.settings.store_backoff, || {
            self.store.transition_run(transition.clone())
        })
        .await?;
        info!(
            "Run {} is now {}/{}",
            run_id, outcome.run.status, outcome.run.phase
        );
        for event in outcome.events {
            let _ = self.events.send(event);
        }
        Ok(outcome.run)
    }

    pub(crate) async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_transient(label, self.settings.store_backoff, op).await
    }

    pub async fn spawn(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        let description = req.task.trim().to_string();
        if description.is_empty() {
            return Err(Error::invalid_args("task must be a non-empty string"));
        }

        let idempotency = match normalize_key(req.idempotency_key.as_deref()) {
            Some(key) => Some(IdempotencyClaim {
                key,
                fingerprint: fingerprint(&req)?,
                ttl: self.settings.idempotency_ttl,
            }),
            None => None,
        };

        // A live binding answers before resolution, so later policy or
        // profile edits cannot change the outcome of a resubmit.
        if let Some(claim) = &idempotency
            && let Some(existing) = self.store.get_idempotency(&claim.key).await?
            && !existing.is_expired(Utc::now())
        {
            if existing.fingerprint != claim.fingerprint {
                return Err(Error::conflict(format!(
                    "idempotency key '{}' is bound to a different request",
                    claim.key
                )));
            }
            let run = self.store.get_run(existing.run_id).await?;
            info!("Idempotency key matched existing run {}", run.id);
            return Ok(SpawnOutcome { run, created: false });
        }

        let profile = self.lookup_profile(&req).await?;
        let mut rules = self
            .store
            .get_policy(DEFAULT_POLICY_KEY)
            .await?
            .map(|p| p.rules)
            .unwrap_or_default();
        if let Some(p) = &profile
            && let Some(specific) = self.store.get_policy(&policy::profile_policy_key(&p.key)).await?
        {
            rules = rules.merged_with(&specific.rules);
        }

        let input = ResolveInput {
            runner_type: req.runner_type,
            requires_approval: req.requires_approval,
            timeout: req.timeout,
            workspace_path: req.workspace_path.clone(),
            scope_path: req.scope_path.clone(),
        };
        let defaults = ResolveDefaults {
            timeout: self.settings.default_timeout,
            requires_approval: self.settings.default_requires_approval,
            allow_list: self.settings.runner_allow_list.clone(),
            root: self.settings.default_root.clone(),
        };
        let resolved = policy::resolve(&input, profile.as_ref(), &rules, &defaults)?;
        if self.runners.get(resolved.runner_type).is_none() {
            return Err(Error::invalid_args(format!(
                "no runner is configured for {}",
                resolved.runner_type
            )));
        }

        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| title_from(&description));
        let new_task = NewTask {
            title,
            description,
            scope_path: resolved.scope_path.clone(),
            project_root: resolved.project_root.clone(),
            created_by: req.created_by.clone().unwrap_or_else(|| "api".to_string()),
            context: req.context.clone(),
        };
        let new_run = NewRun {
            task: TaskSource::New(new_task),
            profile_id: profile.as_ref().map(|p| p.id),
            runner_type: resolved.runner_type,
            requires_approval: resolved.requires_approval,
            timeout_ms: resolved.timeout_ms,
            resolved_config: resolved,
            attempt: 1,
            parent_run_id: None,
            idempotency,
        };

        let outcome = self
            .with_retry("create run", || self.store.create_run(new_run.clone()))
            .await?;
        Ok(match outcome {
            CreateRunOutcome::Created { run, .. } => {
                info!(
                    "Queued run {} ({}) for task {}",
                    run.id, run.runner_type, run.task_id
                );
                self.wake.notify_one();
                SpawnOutcome { run, created: true }
            }
            CreateRunOutcome::Existing { run } => {
                info!("Idempotency key matched existing run {}", run.id);
                SpawnOutcome { run, created: false }
            }
        })
    }

    async fn lookup_profile(&self, req: &SpawnRequest) -> Result<Option<Profile>> {
        if let Some(key) = req.profile_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return match self.store.get_profile_by_key(key).await? {
                Some(p) => Ok(Some(p)),
                None => Err(Error::not_found("profile", key)),
            };
        }
        // A profile keyed by the runner tag acts as that runner's defaults.
        let runner = req.runner_type.unwrap_or_default();
        self.store.get_profile_by_key(runner.as_str()).await
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.store.get_run(id).await
    }

    pub async fn list_runs(&self, query: &ListRunsQuery) -> Result<Vec<Run>> {
        let filter = query.to_filter()?;
        self.store
            .list_runs(&filter, Page::new(query.limit, query.offset))
            .await
    }

    pub async fn list_events(&self, run_id: Uuid, after_seq: Option<i64>, page: Page) -> Result<Vec<RunEvent>> {
        self.store.get_run(run_id).await?;
        self.store.list_events(run_id, after_seq, page).await
    }

    pub async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.store.get_run(run_id).await?;
        self.store.list_checkpoints(run_id).await
    }

    pub async fn get_run_diff(&self, run_id: Uuid) -> Result<DiffArtifact> {
        self.store.get_run(run_id).await?;
        self.store
            .latest_diff(run_id)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("run {} has not produced a diff", run_id)))
    }

    /// Cooperative stop. Terminal runs are returned unchanged.
    pub async fn stop_run(&self, run_id: Uuid, reason: &str) -> Result<Run> {
        let reason = if reason.trim().is_empty() { "stopped by request" } else { reason.trim() };
        for _ in 0..3 {
            let run = self.store.get_run(run_id).await?;
            let now = Utc::now();
            let stopped = RunPatch {
                ended_at: Some(now),
                ..RunPatch::default()
            };
            let result = match run.status {
                s if s.is_terminal() => return Ok(run),
                _ if run.phase == RunPhase::Applying => {
                    return Err(Error::precondition(format!(
                        "run {} is applying its diff",
                        run_id
                    )));
                }
                RunStatus::Pending | RunStatus::AwaitingApproval => {
                    self.transition(
                        RunTransition::new(run_id, &[run.status], RunStatus::Stopped, RunPhase::Done)
                            .unless_phase(RunPhase::Applying)
                            .patch(stopped)
                            .event(EventPayload::RunStopped {
                                reason: reason.to_string(),
                            }),
                    )
                    .await
                }
                _ => {
                    let result = self
                        .transition(
                            RunTransition::new(
                                run_id,
                                &[RunStatus::Running],
                                RunStatus::Stopped,
                                RunPhase::Finalizing,
                            )
                            .unless_phase(RunPhase::Applying)
                            .patch(stopped)
                            .event(EventPayload::RunStopped {
                                reason: reason.to_string(),
                            }),
                        )
                        .await;
                    if result.is_ok() {
                        let token = self.active.lock().await.get(&run_id).cloned();
                        match token {
                            Some(token) => token.cancel(),
                            // No local worker will finalize it.
                            None => {
                                return self
                                    .transition(RunTransition::new(
                                        run_id,
                                        &[RunStatus::Stopped],
                                        RunStatus::Stopped,
                                        RunPhase::Done,
                                    ))
                                    .await;
                            }
                        }
                    }
                    result
                }
            };
            match result {
                Ok(run) => {
                    info!("Stopped run {}: {}", run_id, reason);
                    return Ok(run);
                }
                // Raced with the scheduler or the executor; look again.
                Err(e) if e.kind() == ErrorKind::Conflict => continue,
                Err(e) => return Err(e),
            }
        }
        self.store.get_run(run_id).await
    }

    pub async fn reject_run(&self, req: RejectRequest) -> Result<Run> {
        let actor = req.actor.trim();
        if actor.is_empty() {
            return Err(Error::invalid_args("actor must be a non-empty string"));
        }
        let run = self.store.get_run(req.run_id).await?;
        if run.status != RunStatus::AwaitingApproval || run.phase != RunPhase::AwaitingReview {
            return Err(Error::precondition(format!(
                "run {} is {}/{}, not awaiting approval",
                run.id, run.status, run.phase
            )));
        }
        let reason = req.reason.clone().filter(|r| !r.trim().is_empty());
        let run = self
            .transition(
                RunTransition::new(
                    req.run_id,
                    &[RunStatus::AwaitingApproval],
                    RunStatus::Stopped,
                    RunPhase::Done,
                )
                .patch(RunPatch {
                    ended_at: Some(Utc::now()),
                    error_kind: Some("rejected".to_string()),
                    error_message: Some(
                        reason
                            .clone()
                            .unwrap_or_else(|| format!("rejected by {}", actor)),
                    ),
                    ..RunPatch::default()
                })
                .event(EventPayload::Rejected {
                    actor: actor.to_string(),
                    reason,
                })
                .task_status(TaskStatus::Rejected),
            )
            .await
            .map_err(precondition_on_conflict)?;
        info!("Run {} rejected by {}", run.id, actor);
        Ok(run)
    }

    /// New attempt on the same task, pinned to the same resolved config.
    pub async fn retry_run(&self, run_id: Uuid) -> Result<Run> {
        let run = self.store.get_run(run_id).await?;
        if !matches!(
            run.status,
            RunStatus::Failed | RunStatus::TimedOut | RunStatus::Stopped
        ) {
            return Err(Error::precondition(format!(
                "run {} is {}; only failed, timed out or stopped runs can be retried",
                run.id, run.status
            )));
        }
        let resolved = run
            .resolved_config
            .clone()
            .ok_or_else(|| Error::precondition(format!("run {} has no resolved config", run.id)))?;
        let new_run = NewRun {
            task: TaskSource::Existing(run.task_id),
            profile_id: run.profile_id,
            runner_type: run.runner_type,
            resolved_config: resolved,
            requires_approval: run.requires_approval,
            timeout_ms: run.timeout_ms,
            attempt: run.attempt + 1,
            parent_run_id: Some(run.id),
            idempotency: None,
        };
        let outcome = self
            .with_retry("retry run", || self.store.create_run(new_run.clone()))
            .await?;
        let retried = outcome.run().clone();
        info!(
            "Run {} retried as {} (attempt {})",
            run.id, retried.id, retried.attempt
        );
        self.wake.notify_one();
        Ok(retried)
    }

    /// Fail runs a previous process left in `running`. Call before the
    /// scheduler starts.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let filter = RunFilter {
            statuses: vec![RunStatus::Running],
            ..RunFilter::default()
        };
        let mut recovered = 0;
        loop {
            let runs = self
                .store
                .list_runs(&filter, Page::new(Some(crate::core::model::MAX_PAGE_LIMIT), None))
                .await?;
            let batch = recovered;
            if runs.is_empty() {
                break;
            }
            for run in runs {
                let message = "interrupted by a process restart".to_string();
                let res = self
                    .transition(
                        RunTransition::new(run.id, &[RunStatus::Running], RunStatus::Failed, RunPhase::Done)
                            .patch(RunPatch {
                                ended_at: Some(Utc::now()),
                                error_kind: Some("interrupted".to_string()),
                                error_message: Some(message.clone()),
                                ..RunPatch::default()
                            })
                            .event(EventPayload::RunError {
                                kind: "interrupted".to_string(),
                                message: message.clone(),
                                attempt: 0,
                            })
                            .event(EventPayload::RunFailed {
                                error_kind: "interrupted".to_string(),
                                message,
                            }),
                    )
                    .await;
                match res {
                    Ok(_) => recovered += 1,
                    Err(e) => warn!("Could not recover run {}: {}", run.id, e.detail()),
                }
            }
            if recovered == batch {
                break;
            }
        }
        if recovered > 0 {
            warn!("Marked {} interrupted run(s) as failed", recovered);
        }
        Ok(recovered)
    }

    pub async fn create_profile(&self, new: NewProfile) -> Result<Profile> {
        if new.key.trim().is_empty() {
            return Err(Error::invalid_args("profile key must be a non-empty string"));
        }
        if new.default_timeout_minutes <= 0 {
            return Err(Error::invalid_args("default_timeout_minutes must be greater than zero"));
        }
        self.store.create_profile(new).await
    }

    pub async fn list_profiles(&self, page: Page) -> Result<Vec<Profile>> {
        self.store.list_profiles(page).await
    }

    /// By id when `key` parses as one, else by key.
    pub async fn get_profile(&self, key: &str) -> Result<Profile> {
        if let Ok(id) = Uuid::parse_str(key) {
            return self.store.get_profile(id).await;
        }
        self.store
            .get_profile_by_key(key)
            .await?
            .ok_or_else(|| Error::not_found("profile", key))
    }

    pub async fn upsert_policy(&self, key: &str, rules: &PolicyRules) -> Result<Policy> {
        if let Some(max) = rules.max_timeout_minutes
            && max <= 0
        {
            return Err(Error::invalid_args("max_timeout_minutes must be greater than zero"));
        }
        for tag in &rules.runner_allow_list {
            tag.parse::<RunnerType>()?;
        }
        self.store.upsert_policy(key.trim(), rules).await
    }

    pub async fn get_policy(&self, key: &str) -> Result<Policy> {
        self.store
            .get_policy(key)
            .await?
            .ok_or_else(|| Error::not_found("policy", key))
    }

    pub async fn list_policies(&self, page: Page) -> Result<Vec<Policy>> {
        self.store.list_policies(page).await
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.store.delete_task(id).await?;
        info!("Deleted task {}", id);
        Ok(())
    }
}

fn precondition_on_conflict(err: Error) -> Error {
    if err.kind() == ErrorKind::Conflict {
        Error::precondition(err.message().to_string())
    } else {
        err
    }
}

/// First line of the description, shortened.
fn title_from(description: &str) -> String {
    let line = description.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= 80 {
        line.to_string()
    } else {
        let cut: String = line.chars().take(77).collect();
        format!("{}...", cut)
    }
}
