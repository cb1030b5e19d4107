//! Deterministic runner for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{RunContext, RunnerAdapter, RunnerHandle};
use crate::core::error::{Error, Result};
use crate::core::model::{Diff, ResolvedConfig, RunnerType};
use crate::core::orchestrator::workspace::Workspace;

#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Write these `(path, content)` pairs into the sandbox, then finish.
    Write(Vec<(String, String)>),
    /// Delete these sandbox paths, then finish.
    Delete(Vec<String>),
    /// Never finish until cancelled.
    Hang,
    /// Never finish and ignore cancellation.
    Stubborn,
    Fail(String),
}

pub(crate) struct ScriptedRunner {
    runner_type: RunnerType,
    script: Script,
    workers: Mutex<HashMap<String, (Workspace, CancellationToken)>>,
    pub(crate) started: AtomicUsize,
}

impl ScriptedRunner {
    pub(crate) fn new(runner_type: RunnerType, script: Script) -> Self {
        Self {
            runner_type,
            script,
            workers: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RunnerAdapter for ScriptedRunner {
    fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    async fn start(
        &self,
        ctx: &RunContext,
        _config: &ResolvedConfig,
        workspace: &Workspace,
    ) -> Result<RunnerHandle> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.checkpoint("runner", serde_json::json!({ "step": "started" }))
            .await?;
        let id = format!("scripted:{}", ctx.run_id);
        self.workers
            .lock()
            .await
            .insert(id.clone(), (workspace.clone(), CancellationToken::new()));
        Ok(RunnerHandle {
            id,
            runner_type: self.runner_type,
        })
    }

    async fn collect(&self, handle: &RunnerHandle) -> Result<Diff> {
        let (workspace, cancel) = self
            .workers
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::not_found("runner handle", &handle.id))?;

        match &self.script {
            Script::Write(files) => {
                for (path, content) in files {
                    let target = workspace.sandbox_path.join(path);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(target, content)?;
                }
                workspace.diff()
            }
            Script::Delete(paths) => {
                for path in paths {
                    std::fs::remove_file(workspace.sandbox_path.join(path))?;
                }
                workspace.diff()
            }
            Script::Hang | Script::Stubborn => {
                cancel.cancelled().await;
                Err(Error::internal("runner was cancelled"))
            }
            Script::Fail(message) => Err(Error::internal(message.clone())),
        }
    }

    async fn cancel(&self, handle: &RunnerHandle) -> Result<()> {
        if matches!(self.script, Script::Stubborn) {
            std::future::pending::<()>().await;
        }
        if let Some((_, token)) = self.workers.lock().await.get(&handle.id) {
            token.cancel();
        }
        Ok(())
    }
}
