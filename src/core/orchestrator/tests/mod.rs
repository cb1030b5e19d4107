mod policy;
mod workspace;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::runners::scripted::{Script, ScriptedRunner};
use super::{Orchestrator, OrchestratorSettings, RunnerRegistry, SpawnRequest};
use crate::core::model::{EventType, Page, Run, RunEvent, RunnerType};
use crate::core::store::{Backoff, SharedStore, SqliteStore};

pub(crate) struct Harness {
    pub orch: Arc<Orchestrator>,
    pub store: SharedStore,
    pub project: TempDir,
    pub shutdown: CancellationToken,
    pub scheduler: Option<tokio::task::JoinHandle<()>>,
    _data: TempDir,
}

pub(crate) fn settings(project: &Path, data: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrent_runs: 2,
        default_timeout: Duration::from_secs(30),
        default_requires_approval: false,
        cancel_grace: Duration::from_millis(500),
        idempotency_ttl: chrono::Duration::hours(1),
        store_backoff: Backoff {
            attempts: 3,
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
        },
        scheduler_tick: Duration::from_millis(20),
        lock_ttl: Duration::from_secs(30),
        runner_allow_list: RunnerType::ALL.to_vec(),
        default_root: project.to_path_buf(),
        sandbox_root: data.join("sandboxes"),
        commit_on_apply: false,
    }
}

pub(crate) async fn harness_with(
    runners: Vec<Arc<ScriptedRunner>>,
    tweak: impl FnOnce(&mut OrchestratorSettings),
    run_scheduler: bool,
) -> Harness {
    let project = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("lib.rs"), "fn main() {}\n").unwrap();

    let store: SharedStore = Arc::new(SqliteStore::open(&data.path().join("agent.db")).await.unwrap());
    let mut registry = RunnerRegistry::new();
    for runner in runners {
        registry.register(runner);
    }
    let mut cfg = settings(&project.path().canonicalize().unwrap(), data.path());
    tweak(&mut cfg);

    let orch = Arc::new(Orchestrator::new(store.clone(), registry, cfg));
    let shutdown = CancellationToken::new();
    let scheduler = run_scheduler.then(|| tokio::spawn(orch.clone().run_scheduler(shutdown.clone())));
    Harness {
        orch,
        store,
        project,
        shutdown,
        scheduler,
        _data: data,
    }
}

pub(crate) async fn harness(script: Script) -> Harness {
    let runner = Arc::new(ScriptedRunner::new(RunnerType::ClaudeCode, script));
    harness_with(vec![runner], |_| {}, true).await
}

pub(crate) fn request(task: &str) -> SpawnRequest {
    SpawnRequest {
        task: task.to_string(),
        runner_type: Some(RunnerType::ClaudeCode),
        ..SpawnRequest::default()
    }
}

/// Poll until `pred` holds, failing the test after a few seconds.
pub(crate) async fn wait_for(orch: &Orchestrator, run_id: Uuid, pred: impl Fn(&Run) -> bool) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = orch.get_run(run_id).await.unwrap();
        if pred(&run) {
            return run;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run {} stuck at {}/{}", run.id, run.status, run.phase);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub(crate) async fn events(orch: &Orchestrator, run_id: Uuid) -> Vec<RunEvent> {
    orch.list_events(run_id, None, Page::new(Some(1000), None))
        .await
        .unwrap()
}

pub(crate) fn types(events: &[RunEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type()).collect()
}

/// True when `wanted` appears in `seen` in order, not necessarily adjacent.
pub(crate) fn in_order(seen: &[EventType], wanted: &[EventType]) -> bool {
    let mut it = seen.iter();
    wanted.iter().all(|w| it.any(|s| s == w))
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler.take() {
            handle.abort();
        }
    }
}
