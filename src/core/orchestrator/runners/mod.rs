//! Runner adapters: opaque workers that turn a task plus a sandboxed
//! workspace into a diff.
//!
//! The engine drives every adapter the same way: `start` returns a handle,
//! `collect` waits for the diff, and `cancel` asks the worker behind a handle
//! to stop. Adapters must tolerate `cancel` racing `collect`.

mod command;
#[cfg(test)]
pub(crate) mod scripted;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::core::error::Result;
use crate::core::model::{ContextAttachment, Diff, ResolvedConfig, RunnerType};
use crate::core::store::SharedStore;

use super::workspace::Workspace;

pub use command::CommandRunner;

/// Opaque reference to a started worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerHandle {
    pub id: String,
    pub runner_type: RunnerType,
}

/// What an adapter sees of the run it works on.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub attempt: i32,
    pub title: String,
    pub description: String,
    pub attachments: Vec<ContextAttachment>,
    store: SharedStore,
}

impl RunContext {
    pub(crate) fn new(
        run_id: Uuid,
        attempt: i32,
        title: String,
        description: String,
        attachments: Vec<ContextAttachment>,
        store: SharedStore,
    ) -> Self {
        Self {
            run_id,
            attempt,
            title,
            description,
            attachments,
            store,
        }
    }

    /// Record runner-internal state under `label`, replacing any earlier
    /// snapshot with the same label.
    pub async fn checkpoint(&self, label: &str, snapshot: Value) -> Result<()> {
        self.store
            .save_checkpoint(self.run_id, label, snapshot)
            .await?;
        Ok(())
    }

    /// Task text handed to the runner: description plus any attachments.
    pub fn prompt(&self) -> String {
        let mut prompt = self.description.clone();
        for attachment in &self.attachments {
            let label = if attachment.label.is_empty() {
                &attachment.key
            } else {
                &attachment.label
            };
            prompt.push_str(&format!("\n\n[{}: {}]\n{}", attachment.kind, label, attachment.content));
        }
        prompt
    }
}

#[async_trait]
pub trait RunnerAdapter: Send + Sync {
    fn runner_type(&self) -> RunnerType;

    async fn start(
        &self,
        ctx: &RunContext,
        config: &ResolvedConfig,
        workspace: &Workspace,
    ) -> Result<RunnerHandle>;

    /// Wait for the worker to finish and return what it changed.
    async fn collect(&self, handle: &RunnerHandle) -> Result<Diff>;

    async fn cancel(&self, handle: &RunnerHandle) -> Result<()>;
}

/// Adapters by runner type. Later registrations replace earlier ones.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    adapters: HashMap<RunnerType, Arc<dyn RunnerAdapter>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandRunner`] per configured runner command.
    pub fn from_config(cfg: &RunnerConfig) -> Self {
        let mut registry = Self::new();
        for (tag, argv) in &cfg.commands {
            match RunnerType::from_tag(tag) {
                Some(runner_type) if !argv.is_empty() => {
                    registry.register(Arc::new(CommandRunner::new(runner_type, argv.clone())));
                }
                _ => tracing::warn!("Ignoring runner command for '{}'", tag),
            }
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn RunnerAdapter>) {
        self.adapters.insert(adapter.runner_type(), adapter);
    }

    pub fn get(&self, runner_type: RunnerType) -> Option<Arc<dyn RunnerAdapter>> {
        self.adapters.get(&runner_type).cloned()
    }

    pub fn runner_types(&self) -> Vec<RunnerType> {
        let mut types: Vec<RunnerType> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
