use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::core::error::ErrorKind;
use crate::core::model::{ContextAttachment, RunSummary};

async fn open_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("store.db")).await.unwrap();
    (dir, store)
}

fn resolved() -> ResolvedConfig {
    ResolvedConfig {
        runner_type: RunnerType::Codex,
        requires_approval: true,
        timeout_ms: 60_000,
        project_root: "/tmp/project".to_string(),
        scope_path: ".".to_string(),
        profile_key: None,
        runner_allow_list: vec!["codex".to_string()],
        runner_options: Default::default(),
    }
}

fn new_task(title: &str) -> NewTask {
    NewTask {
        title: title.to_string(),
        description: "fix the flaky test".to_string(),
        scope_path: ".".to_string(),
        project_root: "/tmp/project".to_string(),
        created_by: "tests".to_string(),
        context: Vec::new(),
    }
}

fn new_run(task: TaskSource, claim: Option<(&str, &str)>) -> NewRun {
    NewRun {
        task,
        profile_id: None,
        runner_type: RunnerType::Codex,
        resolved_config: resolved(),
        requires_approval: true,
        timeout_ms: 60_000,
        attempt: 1,
        parent_run_id: None,
        idempotency: claim.map(|(key, fingerprint)| IdempotencyClaim {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            ttl: chrono::Duration::hours(1),
        }),
    }
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn create(store: &dyn Store, title: &str) -> (Run, Task) {
    match store
        .create_run(new_run(TaskSource::New(new_task(title)), None))
        .await
        .unwrap()
    {
        CreateRunOutcome::Created { run, task } => (run, task),
        CreateRunOutcome::Existing { .. } => panic!("expected a fresh run"),
    }
}

async fn start(store: &dyn Store, run_id: Uuid) -> TransitionOutcome {
    store
        .transition_run(
            RunTransition::new(run_id, &[RunStatus::Pending], RunStatus::Running, RunPhase::Initializing)
                .patch(RunPatch {
                    started_at: Some(Utc::now()),
                    sandbox_id: Some("sbx-1".to_string()),
                    ..Default::default()
                })
                .event(EventPayload::RunStarted {
                    sandbox_id: Some("sbx-1".to_string()),
                }),
        )
        .await
        .unwrap()
}

// Scenarios shared by both dialects.

async fn create_run_records_task_and_first_event(store: &dyn Store) {
    let (run, task) = create(store, "first").await;
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.phase, RunPhase::Queued);
    assert_eq!(run.task_id, task.id);
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(run.resolved_config, Some(resolved()));

    let events = store.list_events(run.id, None, Page::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].seq, 1);
    assert!(matches!(
        events[0].payload,
        EventPayload::RunCreated { task_id, attempt: 1, .. } if task_id == task.id
    ));
}

async fn nullable_json_columns_round_trip(store: &dyn Store) {
    let (run, task) = create(store, "nulls").await;
    assert!(run.summary.is_none());
    assert!(task.context.is_empty());

    let mut with_context = new_task("context");
    with_context.context = vec![ContextAttachment {
        kind: "file".to_string(),
        key: "src/lib.rs".to_string(),
        ..Default::default()
    }];
    let task = store.create_task(with_context).await.unwrap();
    let loaded = store.get_task(task.id).await.unwrap();
    assert_eq!(loaded.context.len(), 1);
    assert_eq!(loaded.context[0].kind, "file");

    let profile = store
        .create_profile(NewProfile {
            key: unique("bare"),
            runner_type: RunnerType::ClaudeCode,
            config: Default::default(),
            default_timeout_minutes: 15,
            requires_approval: false,
        })
        .await
        .unwrap();
    assert!(profile.config.is_empty());
    let fetched = store.get_profile(profile.id).await.unwrap();
    assert_eq!(fetched, profile);
}

async fn one_active_run_per_task(store: &dyn Store) {
    let (run, task) = create(store, "single").await;
    let err = store
        .create_run(new_run(TaskSource::Existing(task.id), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    store
        .transition_run(
            RunTransition::new(run.id, &[RunStatus::Pending], RunStatus::Stopped, RunPhase::Done)
                .event(EventPayload::RunStopped {
                    reason: "operator".to_string(),
                }),
        )
        .await
        .unwrap();
    let retry = store
        .create_run(new_run(TaskSource::Existing(task.id), None))
        .await
        .unwrap();
    assert_ne!(retry.run().id, run.id);
}

async fn idempotent_create_returns_existing_run(store: &dyn Store) {
    let key = unique("key");
    let first = store
        .create_run(new_run(TaskSource::New(new_task("idem")), Some((&key, "fp-1"))))
        .await
        .unwrap();
    assert!(matches!(first, CreateRunOutcome::Created { .. }));

    let again = store
        .create_run(new_run(TaskSource::New(new_task("idem")), Some((&key, "fp-1"))))
        .await
        .unwrap();
    match again {
        CreateRunOutcome::Existing { run } => assert_eq!(run.id, first.run().id),
        other => panic!("expected existing run, got {:?}", other),
    }

    let err = store
        .create_run(new_run(TaskSource::New(new_task("idem")), Some((&key, "fp-2"))))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let record = store.get_idempotency(&key).await.unwrap().unwrap();
    assert_eq!(record.run_id, first.run().id);
    assert_eq!(record.fingerprint, "fp-1");
}

async fn transition_guards(store: &dyn Store) {
    let (run, _) = create(store, "guards").await;

    let err = store
        .transition_run(RunTransition::new(
            run.id,
            &[RunStatus::Pending],
            RunStatus::AwaitingApproval,
            RunPhase::AwaitingReview,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = store
        .transition_run(RunTransition::new(
            run.id,
            &[RunStatus::Running],
            RunStatus::Completed,
            RunPhase::Done,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    start(store, run.id).await;
    let err = store
        .transition_run(RunTransition::new(
            run.id,
            &[RunStatus::Running],
            RunStatus::Running,
            RunPhase::Queued,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = store
        .transition_run(
            RunTransition::new(run.id, &[RunStatus::Running], RunStatus::Stopped, RunPhase::Finalizing)
                .unless_phase(RunPhase::Initializing),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.get_run(run.id).await.unwrap().status, RunStatus::Running);

    let err = store
        .transition_run(RunTransition::new(
            Uuid::new_v4(),
            &[RunStatus::Pending],
            RunStatus::Running,
            RunPhase::Initializing,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Failed attempts leave no events behind.
    let events = store.list_events(run.id, None, Page::default()).await.unwrap();
    assert_eq!(events.len(), 2);
}

async fn transition_applies_patch_and_mirrors_task(store: &dyn Store) {
    let (run, task) = create(store, "mirror").await;
    let started = start(store, run.id).await;
    assert_eq!(started.run.status, RunStatus::Running);
    assert_eq!(started.run.sandbox_id.as_deref(), Some("sbx-1"));
    assert!(started.run.started_at.is_some());
    assert_eq!(started.events.len(), 1);
    assert_eq!(started.events[0].seq, 2);
    assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Running);

    let summary = RunSummary {
        files_changed: 2,
        additions: 10,
        deletions: 3,
        ..Default::default()
    };
    let done = store
        .transition_run(
            RunTransition::new(run.id, &[RunStatus::Running], RunStatus::Completed, RunPhase::Done)
                .patch(RunPatch {
                    ended_at: Some(Utc::now()),
                    summary: Some(summary.clone()),
                    ..Default::default()
                })
                .event(EventPayload::RunCompleted { duration_ms: 5 }),
        )
        .await
        .unwrap();
    assert_eq!(done.run.summary, Some(summary));
    // COALESCE keeps fields the patch leaves unset.
    assert_eq!(done.run.sandbox_id.as_deref(), Some("sbx-1"));
    assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Completed);
}

async fn event_sequence_is_gap_free_under_concurrency(store: Arc<dyn Store>) {
    let (run, _) = create(store.as_ref(), "events").await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .save_checkpoint(run.id, &format!("cp-{}", i), json!({ "i": i }))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = store.list_events(run.id, None, Page::default()).await.unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=17).collect::<Vec<_>>());
    for pair in events.windows(2) {
        assert!(pair[0].emitted_at < pair[1].emitted_at);
    }

    let tail = store
        .list_events(run.id, Some(15), Page::default())
        .await
        .unwrap();
    assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![16, 17]);
}

async fn concurrent_idempotent_creates_yield_one_run(store: Arc<dyn Store>) {
    let key = unique("race");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_run(new_run(TaskSource::New(new_task("race")), Some((&key, "fp"))))
                .await
                .unwrap()
                .run()
                .id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

async fn checkpoints_upsert_by_label(store: &dyn Store) {
    let (run, _) = create(store, "checkpoints").await;
    store
        .save_checkpoint(run.id, "plan", json!({ "step": 1 }))
        .await
        .unwrap();
    let second = store
        .save_checkpoint(run.id, "plan", json!({ "step": 2 }))
        .await
        .unwrap();
    assert_eq!(second.snapshot, json!({ "step": 2 }));

    let all = store.list_checkpoints(run.id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(store.get_checkpoint(run.id, "missing").await.unwrap().is_none());

    let err = store
        .save_checkpoint(run.id, " ", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

async fn locks_exclude_other_holders(store: &dyn Store) {
    let name = unique("apply");
    let held = store
        .acquire_lock(&name, "a", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(held.unwrap().holder_id, "a");
    assert!(
        store
            .acquire_lock(&name, "b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
    // Same holder refreshes.
    assert!(
        store
            .acquire_lock(&name, "a", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );
    assert!(!store.release_lock(&name, "b").await.unwrap());
    assert!(!store.try_reclaim_lock(&name).await.unwrap());
    assert!(store.release_lock(&name, "a").await.unwrap());
    assert!(store.get_lock(&name).await.unwrap().is_none());

    store
        .acquire_lock(&name, "a", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(
        store
            .acquire_lock(&name, "b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );
}

async fn expired_idempotency_keys_are_rebound_and_purged(store: &dyn Store) {
    let key = unique("ttl");
    let run_id = Uuid::new_v4();
    let bound = store
        .bind_or_return(&key, "fp-1", run_id, chrono::Duration::zero())
        .await
        .unwrap();
    assert!(matches!(bound, Binding::Bound(_)));

    let rebound = store
        .bind_or_return(&key, "fp-2", Uuid::new_v4(), chrono::Duration::milliseconds(-1))
        .await
        .unwrap();
    assert!(matches!(rebound, Binding::Bound(ref r) if r.fingerprint == "fp-2"));

    let removed = store.purge_expired_idempotency(Utc::now()).await.unwrap();
    assert!(removed >= 1);
    assert!(store.get_idempotency(&key).await.unwrap().is_none());
}

async fn list_runs_filters_and_pages(store: &dyn Store) {
    let (a, task_a) = create(store, "list-a").await;
    let (b, _) = create(store, "list-b").await;
    start(store, b.id).await;

    let by_task = store
        .list_runs(
            &RunFilter {
                task_id: Some(task_a.id),
                ..Default::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_task.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id]);

    let running = store
        .list_runs(
            &RunFilter {
                statuses: vec![RunStatus::Running],
                created_after: Some(a.created_at),
                ..Default::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert!(running.iter().any(|r| r.id == b.id));
    assert!(running.iter().all(|r| r.status == RunStatus::Running));

    let newest = store
        .list_runs(&RunFilter::default(), Page::new(Some(1), None))
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);

    let err = store
        .list_runs(&RunFilter::default(), Page::new(Some(0), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    let err = store
        .list_events(a.id, None, Page::new(None, Some(-1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

async fn policies_and_diffs(store: &dyn Store) {
    let key = unique("policy");
    let rules = PolicyRules {
        requires_approval: Some(true),
        max_timeout_minutes: Some(20),
        runner_allow_list: vec!["codex".to_string()],
    };
    let first = store.upsert_policy(&key, &rules).await.unwrap();
    let updated = store
        .upsert_policy(&key, &PolicyRules::default())
        .await
        .unwrap();
    assert_eq!(first.id, updated.id);
    assert_eq!(store.get_policy(&key).await.unwrap().unwrap().rules, PolicyRules::default());

    let (run, _) = create(store, "diffs").await;
    assert!(store.latest_diff(run.id).await.unwrap().is_none());
    let diff = Diff {
        unified_diff: "--- a/x\n+++ b/x\n".to_string(),
        files: vec![crate::core::model::FileChange {
            path: "x".to_string(),
            change_type: crate::core::model::ChangeType::Modified,
            additions: 1,
            deletions: 1,
            old_sha256: None,
            new_content: Some("y\n".to_string()),
            binary: false,
        }],
    };
    store.save_diff(run.id, "sbx-1", &Diff::default()).await.unwrap();
    let saved = store.save_diff(run.id, "sbx-1", &diff).await.unwrap();
    let latest = store.latest_diff(run.id).await.unwrap().unwrap();
    assert_eq!(latest.id, saved.id);
    assert_eq!(latest.stats.files_changed, 1);
    assert_eq!(latest.files, diff.files);
}

async fn delete_task_requires_idle_task(store: &dyn Store) {
    let key = unique("delete");
    let outcome = store
        .create_run(new_run(TaskSource::New(new_task("delete")), Some((&key, "fp"))))
        .await
        .unwrap();
    let run = outcome.run().clone();

    let err = store.delete_task(run.task_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    store
        .transition_run(RunTransition::new(
            run.id,
            &[RunStatus::Pending],
            RunStatus::Failed,
            RunPhase::Done,
        ))
        .await
        .unwrap();
    store.delete_task(run.task_id).await.unwrap();

    assert_eq!(
        store.get_run(run.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(store.get_idempotency(&key).await.unwrap().is_none());
    assert_eq!(
        store.delete_task(run.task_id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

async fn profile_updates_blocked_by_active_runs(store: &dyn Store) {
    let profile = store
        .create_profile(NewProfile {
            key: unique("profile"),
            runner_type: RunnerType::Codex,
            config: Default::default(),
            default_timeout_minutes: 30,
            requires_approval: true,
        })
        .await
        .unwrap();
    assert_eq!(
        store
            .get_profile_by_key(&profile.key)
            .await
            .unwrap()
            .map(|p| p.id),
        Some(profile.id)
    );

    let mut run = new_run(TaskSource::New(new_task("profiled")), None);
    run.profile_id = Some(profile.id);
    store.create_run(run).await.unwrap();

    let mut changed = profile.clone();
    changed.default_timeout_minutes = 45;
    let err = store.update_profile(&changed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn embedded_create_run_records_task_and_first_event() {
    let (_dir, store) = open_store().await;
    create_run_records_task_and_first_event(&store).await;
}

#[tokio::test]
async fn embedded_nullable_json_columns_round_trip() {
    let (_dir, store) = open_store().await;
    nullable_json_columns_round_trip(&store).await;
}

#[tokio::test]
async fn embedded_one_active_run_per_task() {
    let (_dir, store) = open_store().await;
    one_active_run_per_task(&store).await;
}

#[tokio::test]
async fn embedded_idempotent_create_returns_existing_run() {
    let (_dir, store) = open_store().await;
    idempotent_create_returns_existing_run(&store).await;
}

#[tokio::test]
async fn embedded_transition_guards() {
    let (_dir, store) = open_store().await;
    transition_guards(&store).await;
}

#[tokio::test]
async fn embedded_transition_applies_patch_and_mirrors_task() {
    let (_dir, store) = open_store().await;
    transition_applies_patch_and_mirrors_task(&store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn embedded_event_sequence_is_gap_free_under_concurrency() {
    let (_dir, store) = open_store().await;
    event_sequence_is_gap_free_under_concurrency(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn embedded_concurrent_idempotent_creates_yield_one_run() {
    let (_dir, store) = open_store().await;
    concurrent_idempotent_creates_yield_one_run(Arc::new(store)).await;
}

#[tokio::test]
async fn embedded_checkpoints_upsert_by_label() {
    let (_dir, store) = open_store().await;
    checkpoints_upsert_by_label(&store).await;
}

#[tokio::test]
async fn embedded_locks_exclude_other_holders() {
    let (_dir, store) = open_store().await;
    locks_exclude_other_holders(&store).await;
}

#[tokio::test]
async fn embedded_expired_idempotency_keys_are_rebound_and_purged() {
    let (_dir, store) = open_store().await;
    expired_idempotency_keys_are_rebound_and_purged(&store).await;
}

#[tokio::test]
async fn embedded_list_runs_filters_and_pages() {
    let (_dir, store) = open_store().await;
    list_runs_filters_and_pages(&store).await;
}

#[tokio::test]
async fn embedded_policies_and_diffs() {
    let (_dir, store) = open_store().await;
    policies_and_diffs(&store).await;
}

#[tokio::test]
async fn embedded_delete_task_requires_idle_task() {
    let (_dir, store) = open_store().await;
    delete_task_requires_idle_task(&store).await;
}

#[tokio::test]
async fn embedded_profile_updates_blocked_by_active_runs() {
    let (_dir, store) = open_store().await;
    profile_updates_blocked_by_active_runs(&store).await;
}

#[tokio::test]
async fn embedded_next_pending_runs_is_fifo() {
    let (_dir, store) = open_store().await;
    let (first, _) = create(&store, "one").await;
    let (second, _) = create(&store, "two").await;
    let (third, _) = create(&store, "three").await;
    start(&store, second.id).await;

    let pending = store.next_pending_runs(10).await.unwrap();
    assert_eq!(
        pending.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![first.id, third.id]
    );
    assert_eq!(store.count_runs(RunStatus::Pending).await.unwrap(), 2);
    assert_eq!(store.count_runs(RunStatus::Running).await.unwrap(), 1);
}

#[tokio::test]
async fn embedded_reopen_keeps_data_and_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let run_id = {
        let store = SqliteStore::open(&path).await.unwrap();
        let (run, _) = create(&store, "persist").await;
        store.close().await;
        run.id
    };
    let store = SqliteStore::open(&path).await.unwrap();
    assert_eq!(store.dialect(), Dialect::Embedded);
    store.health_check().await.unwrap();
    assert_eq!(store.get_run(run_id).await.unwrap().id, run_id);
    // The bootstrap lock is released once the schema is in place.
    assert!(store.get_lock(SCHEMA_LOCK).await.unwrap().is_none());
}

#[tokio::test]
async fn connect_opens_configured_embedded_path() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DbConfig {
        embedded: crate::config::EmbeddedDbConfig {
            path: Some(dir.path().join("nested").join("agent.db")),
        },
        ..Default::default()
    };
    let store = connect(&cfg).await.unwrap();
    assert_eq!(store.dialect(), Dialect::Embedded);
    assert!(dir.path().join("nested").join("agent.db").exists());
}

#[test]
fn backoff_grows_and_caps() {
    let backoff = Backoff {
        attempts: 5,
        base: Duration::from_millis(100),
        max: Duration::from_millis(350),
        jitter: 0.0,
    };
    assert_eq!(backoff.delay(0), Duration::from_millis(100));
    assert_eq!(backoff.delay(1), Duration::from_millis(200));
    assert_eq!(backoff.delay(2), Duration::from_millis(350));

    let jittered = Backoff { jitter: 0.25, ..backoff };
    for attempt in 0..5 {
        assert!(jittered.delay(attempt) <= Duration::from_millis(350));
    }
}

#[tokio::test]
async fn retry_transient_stops_on_permanent_errors() {
    let backoff = Backoff {
        attempts: 4,
        base: Duration::from_millis(1),
        max: Duration::from_millis(2),
        jitter: 0.0,
    };
    let calls = std::sync::atomic::AtomicU32::new(0);
    let res: Result<()> = retry_transient("test", backoff, || {
        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(Error::transient("busy"))
            } else {
                Err(Error::invalid_args("bad"))
            }
        }
    })
    .await;
    assert_eq!(res.unwrap_err().kind(), ErrorKind::InvalidArgs);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn emitted_at_is_strictly_increasing() {
    let now = Utc::now();
    let first = next_emitted_at(now, None);
    let second = next_emitted_at(now, Some(first));
    assert!(second > first);
    assert_eq!(second - first, chrono::Duration::microseconds(1));
    let later = next_emitted_at(now + chrono::Duration::seconds(1), Some(second));
    assert!(later > second);
}

/// Runs the shared scenarios against a live Postgres when
/// `AGENT_CORE_TEST_DATABASE_URL` is set; otherwise a no-op.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_dialect_scenarios() {
    let Ok(url) = std::env::var("AGENT_CORE_TEST_DATABASE_URL") else {
        return;
    };
    let cfg = DbConfig {
        backend: "server".to_string(),
        server: crate::config::ServerDbConfig {
            url: Some(url),
            ..Default::default()
        },
        max_retries: 2,
        ..Default::default()
    };
    let store = connect(&cfg).await.unwrap();
    assert_eq!(store.dialect(), Dialect::Server);
    store.health_check().await.unwrap();

    create_run_records_task_and_first_event(store.as_ref()).await;
    nullable_json_columns_round_trip(store.as_ref()).await;
    one_active_run_per_task(store.as_ref()).await;
    idempotent_create_returns_existing_run(store.as_ref()).await;
    transition_guards(store.as_ref()).await;
    transition_applies_patch_and_mirrors_task(store.as_ref()).await;
    event_sequence_is_gap_free_under_concurrency(store.clone()).await;
    concurrent_idempotent_creates_yield_one_run(store.clone()).await;
    checkpoints_upsert_by_label(store.as_ref()).await;
    locks_exclude_other_holders(store.as_ref()).await;
    expired_idempotency_keys_are_rebound_and_purged(store.as_ref()).await;
    list_runs_filters_and_pages(store.as_ref()).await;
    policies_and_diffs(store.as_ref()).await;
    delete_task_requires_idle_task(store.as_ref()).await;
    profile_updates_blocked_by_active_runs(store.as_ref()).await;
    store.close().await;
}
