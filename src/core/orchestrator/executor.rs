use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::model::{
    Diff, EventPayload, ResolvedConfig, Run, RunPatch, RunPhase, RunStatus, RunSummary,
};
use crate::core::store::RunTransition;

use super::runners::{RunContext, RunnerAdapter, RunnerHandle};
use super::service::Orchestrator;
use super::workspace::Workspace;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Why the executor stopped waiting on the runner.
enum Interrupt {
    Cancelled,
    Deadline,
}

impl Orchestrator {
    /// Drive one pending run to a terminal status (or to the approval gate).
    pub(crate) async fn drive(self: Arc<Self>, run: Run, cancel: CancellationToken) {
        let run_id = run.id;
        if let Err(e) = self.drive_inner(run, &cancel).await {
            error!("Run {} aborted: {}", run_id, e.detail());
            self.fail_unfinished(run_id, &e).await;
        }
    }

    async fn drive_inner(&self, run: Run, cancel: &CancellationToken) -> Result<()> {
        let Some(config) = run.resolved_config.clone() else {
            return self
                .fail(&run, &[RunStatus::Pending], "config", "run has no resolved config")
                .await;
        };
        let Some(adapter) = self.runners.get(config.runner_type) else {
            return self
                .fail(
                    &run,
                    &[RunStatus::Pending],
                    "runner_unavailable",
                    &format!("no runner is configured for {}", config.runner_type),
                )
                .await;
        };
        let task = self.store.get_task(run.task_id).await?;

        let started = match self
            .transition(
                RunTransition::new(
                    run.id,
                    &[RunStatus::Pending],
                    RunStatus::Running,
                    RunPhase::Initializing,
                )
                .patch(RunPatch {
                    started_at: Some(Utc::now()),
                    ..RunPatch::default()
                })
                .event(EventPayload::RunStarted { sandbox_id: None })
                .event(EventPayload::PhaseChanged {
                    from: RunPhase::Queued,
                    to: RunPhase::Initializing,
                }),
            )
            .await
        {
            Ok(run) => run,
            // Stopped, or claimed by another worker, before we got to it.
            Err(e) if e.kind() == ErrorKind::Conflict => {
                info!("Run {} is no longer pending, skipping", run.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let now = Instant::now();
        let deadline = now
            .checked_add(started.timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);
        info!(
            "Run {} started with {} (timeout {:?})",
            run.id,
            config.runner_type,
            started.timeout()
        );

        let sandbox_root = self.settings.sandbox_root.clone();
        let cfg = config.clone();
        let provisioned =
            tokio::task::spawn_blocking(move || Workspace::provision(&sandbox_root, run.id, &cfg))
                .await
                .map_err(|e| Error::internal("workspace task panicked").with_source(e))
                .and_then(|r| r);
        let workspace = match provisioned {
            Ok(ws) => ws,
            Err(e) => {
                return self
                    .fail(&run, &[RunStatus::Running], "workspace", e.message())
                    .await;
            }
        };

        let snapshot = json!({
            "sandbox_id": workspace.sandbox_id,
            "sandbox_path": workspace.sandbox_path.to_string_lossy(),
            "project_root": workspace.project_root.to_string_lossy(),
            "scope_path": workspace.scope_path,
        });
        self.with_retry("save workspace checkpoint", || {
            self.store.save_checkpoint(run.id, "workspace", snapshot.clone())
        })
        .await?;

        self.transition(
            RunTransition::new(
                run.id,
                &[RunStatus::Running],
                RunStatus::Running,
                RunPhase::Executing,
            )
            .patch(RunPatch {
                sandbox_id: Some(workspace.sandbox_id.clone()),
                ..RunPatch::default()
            })
            .event(EventPayload::PhaseChanged {
                from: RunPhase::Initializing,
                to: RunPhase::Executing,
            }),
        )
        .await
        .map(|_| ())
        .or_else(|e| superseded(e, run.id))?;

        let ctx = RunContext::new(
            run.id,
            run.attempt,
            task.title.clone(),
            task.description.clone(),
            task.context.clone(),
            self.store.clone(),
        );

        let result = self
            .execute(&ctx, &config, &workspace, adapter.as_ref(), cancel, deadline, &started)
            .await;
        workspace.cleanup();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        ctx: &RunContext,
        config: &ResolvedConfig,
        workspace: &Workspace,
        adapter: &dyn RunnerAdapter,
        cancel: &CancellationToken,
        deadline: Instant,
        run: &Run,
    ) -> Result<()> {
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.interrupted(run, Interrupt::Cancelled, adapter, None).await,
            _ = tokio::time::sleep_until(deadline) => return self.interrupted(run, Interrupt::Deadline, adapter, None).await,
            res = adapter.start(ctx, config, workspace) => res,
        };
        let handle = match handle {
            Ok(h) => h,
            Err(e) => return self.runner_failed(run, e).await,
        };

        let diff = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.interrupted(run, Interrupt::Cancelled, adapter, Some(&handle)).await,
            _ = tokio::time::sleep_until(deadline) => return self.interrupted(run, Interrupt::Deadline, adapter, Some(&handle)).await,
            res = adapter.collect(&handle) => res,
        };
        match diff {
            Ok(diff) => self.diff_ready(run, &workspace.sandbox_id, diff).await,
            Err(e) if cancel.is_cancelled() => {
                warn!("Run {} runner exited during cancellation: {}", run.id, e.detail());
                self.interrupted(run, Interrupt::Cancelled, adapter, None).await
            }
            Err(e) => self.runner_failed(run, e).await,
        }
    }

    async fn diff_ready(&self, run: &Run, sandbox_id: &str, diff: Diff) -> Result<()> {
        if diff.is_empty() {
            info!("Run {} finished without changes", run.id);
            let now = Utc::now();
            self.transition(
                RunTransition::new(run.id, &[RunStatus::Running], RunStatus::Completed, RunPhase::Done)
                    .patch(RunPatch {
                        ended_at: Some(now),
                        summary: Some(RunSummary::default()),
                        ..RunPatch::default()
                    })
                    .event(EventPayload::PhaseChanged {
                        from: RunPhase::Executing,
                        to: RunPhase::Done,
                    })
                    .event(EventPayload::RunCompleted {
                        duration_ms: duration_ms(run, now),
                    }),
            )
            .await
            .map(|_| ())
            .or_else(|e| superseded(e, run.id))?;
            return Ok(());
        }

        let artifact = self
            .with_retry("save diff", || self.store.save_diff(run.id, sandbox_id, &diff))
            .await?;
        let stats = artifact.stats.clone();
        let summary = RunSummary {
            files_changed: stats.files_changed,
            additions: stats.additions,
            deletions: stats.deletions,
            ..RunSummary::default()
        };
        info!(
            "Run {} produced a diff: {} file(s), +{} -{}",
            run.id, stats.files_changed, stats.additions, stats.deletions
        );

        let current = match self
            .transition(
                RunTransition::new(
                    run.id,
                    &[RunStatus::Running],
                    RunStatus::Running,
                    RunPhase::ProducingDiff,
                )
                .patch(RunPatch {
                    summary: Some(summary.clone()),
                    ..RunPatch::default()
                })
                .event(EventPayload::PhaseChanged {
                    from: RunPhase::Executing,
                    to: RunPhase::ProducingDiff,
                })
                .event(EventPayload::DiffProduced {
                    sandbox_id: sandbox_id.to_string(),
                    files_changed: stats.files_changed,
                    additions: stats.additions,
                    deletions: stats.deletions,
                }),
            )
            .await
        {
            Ok(run) => run,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                info!("Run {} left running before its diff was recorded", run.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if current.requires_approval {
            self.transition(
                RunTransition::new(
                    run.id,
                    &[RunStatus::Running],
                    RunStatus::AwaitingApproval,
                    RunPhase::AwaitingReview,
                )
                .event(EventPayload::PhaseChanged {
                    from: RunPhase::ProducingDiff,
                    to: RunPhase::AwaitingReview,
                })
                .event(EventPayload::ApprovalRequested {
                    files_changed: stats.files_changed,
                }),
            )
            .await
            .map(|_| ())
            .or_else(|e| superseded(e, run.id))?;
            info!("Run {} is awaiting approval", run.id);
            return Ok(());
        }

        let current = match self
            .transition(
                RunTransition::new(run.id, &[RunStatus::Running], RunStatus::Running, RunPhase::Applying)
                    .event(EventPayload::PhaseChanged {
                        from: RunPhase::ProducingDiff,
                        to: RunPhase::Applying,
                    }),
            )
            .await
        {
            Ok(run) => run,
            Err(e) if e.kind() == ErrorKind::Conflict => return Ok(()),
            Err(e) => return Err(e),
        };
        self.apply_and_finish(&current, &artifact, RunStatus::Running)
            .await
            .map(|_| ())
    }

    async fn runner_failed(&self, run: &Run, err: Error) -> Result<()> {
        warn!("Run {} runner failed: {}", run.id, err.detail());
        let kind = match err.kind() {
            ErrorKind::Internal => "runner_error".to_string(),
            other => other.as_str().to_string(),
        };
        self.fail(run, &[RunStatus::Running], &kind, err.message()).await
    }

    /// Stop or timeout while the runner is active. The run is made terminal
    /// first; the adapter then gets `cancel_grace` to wind down.
    async fn interrupted(
        &self,
        run: &Run,
        why: Interrupt,
        adapter: &dyn RunnerAdapter,
        handle: Option<&RunnerHandle>,
    ) -> Result<()> {
        let now = Utc::now();
        let terminal = match why {
            Interrupt::Deadline => {
                let elapsed_ms = duration_ms(run, now);
                warn!("Run {} timed out after {} ms", run.id, elapsed_ms);
                let res = self
                    .transition(
                        RunTransition::new(
                            run.id,
                            &[RunStatus::Running],
                            RunStatus::TimedOut,
                            RunPhase::Finalizing,
                        )
                        .patch(RunPatch {
                            ended_at: Some(now),
                            error_kind: Some("timeout".to_string()),
                            error_message: Some(format!(
                                "run exceeded its timeout of {} ms",
                                run.timeout_ms
                            )),
                            ..RunPatch::default()
                        })
                        .event(EventPayload::RunTimedOut {
                            timeout_ms: run.timeout_ms,
                            elapsed_ms,
                        }),
                    )
                    .await;
                match res {
                    Ok(_) => RunStatus::TimedOut,
                    // Stopped while the deadline fired.
                    Err(e) if e.kind() == ErrorKind::Conflict => RunStatus::Stopped,
                    Err(e) => return Err(e),
                }
            }
            Interrupt::Cancelled => {
                // Shutdown cancels without touching the row; StopRun has
                // already moved it to stopped.
                let res = self
                    .transition(
                        RunTransition::new(
                            run.id,
                            &[RunStatus::Running],
                            RunStatus::Stopped,
                            RunPhase::Finalizing,
                        )
                        .patch(RunPatch {
                            ended_at: Some(now),
                            ..RunPatch::default()
                        })
                        .event(EventPayload::RunStopped {
                            reason: "shutdown".to_string(),
                        }),
                    )
                    .await;
                match res {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Conflict => {}
                    Err(e) => return Err(e),
                }
                RunStatus::Stopped
            }
        };

        let grace = self.settings.cancel_grace;
        let overran = match handle {
            Some(handle) => match tokio::time::timeout(grace, adapter.cancel(handle)).await {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!("Run {} cancel failed: {}", run.id, e.detail());
                    false
                }
                Err(_) => {
                    warn!(
                        "Run {} runner ignored cancellation for {:?}, abandoning it",
                        run.id, grace
                    );
                    true
                }
            },
            None => false,
        };

        let mut transition = RunTransition::new(run.id, &[terminal], terminal, RunPhase::Done);
        if overran {
            let message = format!("runner did not stop within {:?}", grace);
            transition = transition.event(EventPayload::RunError {
                kind: "cancel_timeout".to_string(),
                message: message.clone(),
                attempt: 0,
            });
            if terminal == RunStatus::Stopped {
                transition = transition.patch(RunPatch {
                    error_kind: Some("cancel_timeout".to_string()),
                    error_message: Some(message),
                    ..RunPatch::default()
                });
            }
        }
        self.transition(transition)
            .await
            .map(|_| ())
            .or_else(|e| superseded(e, run.id))?;
        Ok(())
    }

    /// Move a run to failed with `run_error` and `run_failed` events.
    pub(crate) async fn fail(
        &self,
        run: &Run,
        from: &[RunStatus],
        kind: &str,
        message: &str,
    ) -> Result<()> {
        warn!("Run {} failed ({}): {}", run.id, kind, message);
        self.transition(
            RunTransition::new(run.id, from, RunStatus::Failed, RunPhase::Done)
                .patch(RunPatch {
                    ended_at: Some(Utc::now()),
                    error_kind: Some(kind.to_string()),
                    error_message: Some(message.to_string()),
                    ..RunPatch::default()
                })
                .event(EventPayload::RunError {
                    kind: kind.to_string(),
                    message: message.to_string(),
                    attempt: 0,
                })
                .event(EventPayload::RunFailed {
                    error_kind: kind.to_string(),
                    message: message.to_string(),
                }),
        )
        .await
        .map(|_| ())
        .or_else(|e| superseded(e, run.id))?;
        Ok(())
    }

    /// Last resort after an unexpected error: a run must not stay running
    /// with nobody driving it.
    async fn fail_unfinished(&self, run_id: uuid::Uuid, err: &Error) {
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!("Run {} could not be reloaded: {}", run_id, e.detail());
                return;
            }
        };
        if run.is_terminal() || run.status == RunStatus::AwaitingApproval {
            return;
        }
        let kind = err.kind().as_str().to_string();
        if let Err(e) = self
            .fail(&run, &[RunStatus::Pending, RunStatus::Running], &kind, err.message())
            .await
        {
            error!("Run {} could not be marked failed: {}", run_id, e.detail());
        }
    }
}

fn duration_ms(run: &Run, now: chrono::DateTime<Utc>) -> i64 {
    run.started_at
        .map(|start| (now - start).num_milliseconds().max(0))
        .unwrap_or_default()
}

/// A conflict here means someone else (StopRun, usually) already moved the
/// run on; that is not an executor failure.
fn superseded(err: Error, run_id: uuid::Uuid) -> Result<()> {
    if err.kind() == ErrorKind::Conflict {
        info!("Run {} changed state concurrently: {}", run_id, err.message());
        return Ok(());
    }
    Err(err)
}
