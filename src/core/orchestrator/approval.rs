use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::model::{
    ApproveResult, DiffArtifact, EventPayload, Run, RunPatch, RunPhase, RunStatus, RunSummary,
};
use crate::core::store::RunTransition;

use super::service::{ApproveRequest, Orchestrator};
use super::workspace::{ApplyReport, apply_files, commit_paths};

impl Orchestrator {
    /// Apply an awaiting run's diff to its project root.
    pub async fn approve_run(&self, req: ApproveRequest) -> Result<ApproveResult> {
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
        let artifact = self
            .store
            .latest_diff(run.id)
            .await?
            .ok_or_else(|| Error::precondition(format!("run {} has no diff to apply", run.id)))?;

        let run = self
            .transition(
                RunTransition::new(
                    run.id,
                    &[RunStatus::AwaitingApproval],
                    RunStatus::AwaitingApproval,
                    RunPhase::Applying,
                )
                .event(EventPayload::Approved {
                    actor: actor.to_string(),
                }),
            )
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::Conflict {
                    Error::precondition(format!("run {} is no longer awaiting approval", req.run_id))
                } else {
                    e
                }
            })?;
        info!("Run {} approved by {}", run.id, actor);

        self.apply_and_finish(&run, &artifact, RunStatus::AwaitingApproval)
            .await
    }

    async fn apply_gate(&self, project_root: &str) -> Arc<Mutex<()>> {
        let mut gates = self.apply_gates.lock().await;
        gates
            .entry(project_root.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the gate for `project_root` once no other apply holds or waits
    /// on it. Clones are only handed out under the map lock.
    async fn release_gate(&self, project_root: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.apply_gates.lock().await;
        drop(gate);
        if gates
            .get(project_root)
            .is_some_and(|g| Arc::strong_count(g) == 1)
        {
            gates.remove(project_root);
        }
    }

    /// Applies queue per project root; the `apply:<run-id>` lock is held
    /// for the duration.
    async fn apply_locked(&self, run: &Run, artifact: &DiffArtifact) -> Result<(ApplyReport, Option<String>)> {
        let root = run
            .resolved_config
            .as_ref()
            .map(|c| c.project_root.clone())
            .ok_or_else(|| Error::internal(format!("run {} has no resolved config", run.id)))?;

        let gate = self.apply_gate(&root).await;
        let outcome = {
            let _queued = gate.lock().await;
            self.apply_exclusive(run, &root, artifact).await
        };
        self.release_gate(&root, gate).await;
        outcome
    }

    async fn apply_exclusive(
        &self,
        run: &Run,
        root: &str,
        artifact: &DiffArtifact,
    ) -> Result<(ApplyReport, Option<String>)> {
        let lock_name = format!("apply:{}", run.id);
        let acquired = self
            .with_retry("acquire apply lock", || {
                self.store
                    .acquire_lock(&lock_name, &self.instance_id, self.settings.lock_ttl)
            })
            .await?;
        if acquired.is_none() {
            return Err(Error::conflict(format!(
                "diff for run {} is already being applied",
                run.id
            )));
        }

        let files = artifact.files.clone();
        let root_path = PathBuf::from(root);
        let applied = tokio::task::spawn_blocking(move || apply_files(&root_path, &files))
            .await
            .map_err(|e| Error::internal("apply task panicked").with_source(e));

        let commit = match &applied {
            Ok(report) if self.settings.commit_on_apply && !report.applied.is_empty() => {
                let message = format!("Apply changes from run {}", run.id);
                match commit_paths(&PathBuf::from(root), &report.applied, &message).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        warn!("Run {} changes applied but not committed: {}", run.id, e.detail());
                        None
                    }
                }
            }
            _ => None,
        };

        if let Err(e) = self.store.release_lock(&lock_name, &self.instance_id).await {
            warn!("Failed to release {}: {}", lock_name, e.detail());
        }
        Ok((applied?, commit))
    }

    /// Apply the diff and settle the run: everything applied completes it,
    /// nothing applied fails it, anything in between is partial.
    pub(crate) async fn apply_and_finish(
        &self,
        run: &Run,
        artifact: &DiffArtifact,
        from: RunStatus,
    ) -> Result<ApproveResult> {
        let (report, commit_hash) = match self.apply_locked(run, artifact).await {
            Ok(out) => out,
            Err(e) => {
                let message = format!("apply failed: {}", e.message());
                self.finish_apply_failed(run, from, &message, Vec::new()).await?;
                return Err(e);
            }
        };

        let applied_count = report.applied.len() as i64;
        let remaining = report.remaining();
        if report.applied.is_empty() {
            let message = report
                .failed
                .first()
                .map(|(path, reason)| format!("{}: {}", path, reason))
                .unwrap_or_else(|| "no files applied".to_string());
            self.finish_apply_failed(run, from, &message, remaining.clone())
                .await?;
            return Ok(ApproveResult {
                success: false,
                applied_count: 0,
                remaining,
                is_partial: false,
                commit_hash: None,
            });
        }

        let is_partial = report.is_partial();
        // A partial auto-apply has nobody to follow up, so it completes.
        let to_status = if is_partial && from == RunStatus::AwaitingApproval {
            RunStatus::Approved
        } else {
            RunStatus::Completed
        };
        let now = Utc::now();
        let summary = RunSummary {
            files_changed: artifact.stats.files_changed,
            additions: artifact.stats.additions,
            deletions: artifact.stats.deletions,
            applied_count,
            remaining: remaining.clone(),
            commit_hash: commit_hash.clone(),
        };
        let mut transition = RunTransition::new(run.id, &[from], to_status, RunPhase::Done)
            .patch(RunPatch {
                ended_at: Some(now),
                summary: Some(summary),
                ..RunPatch::default()
            })
            .event(EventPayload::Applied {
                applied_count,
                remaining: remaining.clone(),
                is_partial,
                commit_hash: commit_hash.clone(),
            });
        if to_status == RunStatus::Completed {
            transition = transition.event(EventPayload::RunCompleted {
                duration_ms: run
                    .started_at
                    .map(|s| (now - s).num_milliseconds().max(0))
                    .unwrap_or_default(),
            });
        }
        self.transition(transition).await?;
        info!(
            "Run {} applied {} file(s){}",
            run.id,
            applied_count,
            if is_partial { ", partially" } else { "" }
        );

        Ok(ApproveResult {
            success: true,
            applied_count,
            remaining,
            is_partial,
            commit_hash,
        })
    }

    async fn finish_apply_failed(
        &self,
        run: &Run,
        from: RunStatus,
        message: &str,
        failed: Vec<String>,
    ) -> Result<()> {
        warn!("Run {} could not apply its diff: {}", run.id, message);
        self.transition(
            RunTransition::new(run.id, &[from], RunStatus::Failed, RunPhase::Done)
                .patch(RunPatch {
                    ended_at: Some(Utc::now()),
                    error_kind: Some("apply_failed".to_string()),
                    error_message: Some(message.to_string()),
                    ..RunPatch::default()
                })
                .event(EventPayload::ApplyFailed {
                    message: message.to_string(),
                    failed,
                })
                .event(EventPayload::RunFailed {
                    error_kind: "apply_failed".to_string(),
                    message: message.to_string(),
                }),
        )
        .await?;
        Ok(())
    }
}
