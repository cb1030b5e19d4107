use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{RunContext, RunnerAdapter, RunnerHandle};
use crate::core::error::{Error, Result};
use crate::core::model::{Diff, ResolvedConfig, RunnerType};
use crate::core::orchestrator::workspace::Workspace;

struct Worker {
    child: Option<Child>,
    cancel: CancellationToken,
    workspace: Workspace,
}

/// Runs a coding-agent CLI inside the sandbox. The diff is whatever the
/// process changed there.
pub struct CommandRunner {
    runner_type: RunnerType,
    argv: Vec<String>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl CommandRunner {
    pub fn new(runner_type: RunnerType, argv: Vec<String>) -> Self {
        Self {
            runner_type,
            argv,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn render(&self, prompt: &str, workspace: &Workspace) -> Vec<String> {
        let dir = workspace.sandbox_path.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace("{task}", prompt).replace("{workspace}", &dir))
            .collect()
    }
}

#[async_trait]
impl RunnerAdapter for CommandRunner {
    fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    async fn start(
        &self,
        ctx: &RunContext,
        config: &ResolvedConfig,
        workspace: &Workspace,
    ) -> Result<RunnerHandle> {
        let argv = self.render(&ctx.prompt(), workspace);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::invalid_args(format!(
                "runner command for {} is empty",
                self.runner_type
            )));
        };

        let log = std::fs::File::create(workspace.log_path())?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&workspace.sandbox_path)
            .env("AGENT_CORE_RUN_ID", ctx.run_id.to_string())
            .env("AGENT_CORE_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(model) = config.runner_options.get("model").and_then(|v| v.as_str()) {
            cmd.env("AGENT_CORE_MODEL", model);
        }

        let child = cmd.spawn().map_err(|e| {
            Error::internal(format!("failed to launch {} runner '{}'", self.runner_type, program))
                .with_source(e)
        })?;
        info!(
            "Started {} for run {} (pid {:?})",
            program,
            ctx.run_id,
            child.id()
        );

        let handle = RunnerHandle {
            id: format!("{}:{}", self.runner_type, ctx.run_id),
            runner_type: self.runner_type,
        };
        self.workers.lock().await.insert(
            handle.id.clone(),
            Worker {
                child: Some(child),
                cancel: CancellationToken::new(),
                workspace: workspace.clone(),
            },
        );
        ctx.checkpoint(
            "runner",
            serde_json::json!({ "program": program, "log": workspace.log_path().to_string_lossy() }),
        )
        .await?;
        Ok(handle)
    }

    async fn collect(&self, handle: &RunnerHandle) -> Result<Diff> {
        let (child, cancel, workspace) = {
            let mut workers = self.workers.lock().await;
            let worker = workers
                .get_mut(&handle.id)
                .ok_or_else(|| Error::not_found("runner handle", &handle.id))?;
            (
                worker.child.take(),
                worker.cancel.clone(),
                worker.workspace.clone(),
            )
        };
        let mut child =
            child.ok_or_else(|| Error::conflict(format!("{} is already being collected", handle.id)))?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                self.workers.lock().await.remove(&handle.id);
                return Err(Error::internal("runner was cancelled"));
            }
        };
        self.workers.lock().await.remove(&handle.id);

        if !status.success() {
            return Err(Error::internal(format!(
                "{} runner exited with {}",
                self.runner_type, status
            )));
        }
        tokio::task::spawn_blocking(move || workspace.diff())
            .await
            .map_err(|e| Error::internal("diff task panicked").with_source(e))?
    }

    async fn cancel(&self, handle: &RunnerHandle) -> Result<()> {
        let Some(mut worker) = self.workers.lock().await.remove(&handle.id) else {
            return Ok(());
        };
        worker.cancel.cancel();
        // Not collected yet: nobody else owns the process.
        if let Some(mut child) = worker.child.take()
            && let Err(e) = child.kill().await
        {
            warn!("Failed to kill {}: {}", handle.id, e);
        }
        Ok(())
    }
}
