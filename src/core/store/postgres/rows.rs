use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::PgResultExt;
use crate::core::error::{Error, Result};
use crate::core::model::{
    Checkpoint, DiffArtifact, DiffStats, EventPayload, IdempotencyRecord, Lock, Policy, PolicyRules,
    Profile, Run, RunEvent, RunPhase, RunStatus, RunnerType, Task, TaskStatus,
};
use crate::core::store::codec;

pub(super) const PROFILE_COLUMNS: &str = "id, key, runner_type, config, default_timeout_minutes, requires_approval, created_at, updated_at";

pub(super) const TASK_COLUMNS: &str = "id, title, description, scope_path, project_root, status, created_by, context, created_at, updated_at";

pub(super) const RUN_COLUMNS: &str = "id, task_id, profile_id, runner_type, resolved_config, status, phase, idempotency_key, requires_approval, timeout_ms, attempt, parent_run_id, created_at, updated_at, started_at, ended_at, error_kind, error_message, sandbox_id, summary";

pub(super) const EVENT_COLUMNS: &str = "id, run_id, seq, event_type, payload, emitted_at";

pub(super) const CHECKPOINT_COLUMNS: &str = "id, run_id, label, snapshot, created_at";

pub(super) const IDEMPOTENCY_COLUMNS: &str = "key, fingerprint, run_id, first_seen_at, expires_at";

pub(super) const POLICY_COLUMNS: &str = "id, key, rules, updated_at";

pub(super) const LOCK_COLUMNS: &str = "name, holder_id, acquired_at, expires_at";

pub(super) const DIFF_COLUMNS: &str = "id, run_id, sandbox_id, unified_diff, files, stats, generated_at";

fn json(row: &PgRow, col: &str) -> Result<Option<Value>> {
    row.try_get(col).pg()
}

fn runner_type(row: &PgRow) -> Result<RunnerType> {
    let raw: String = row.try_get("runner_type").pg()?;
    RunnerType::from_tag(&raw)
        .ok_or_else(|| Error::internal("column runner_type holds an unknown runner type"))
}

pub(super) fn profile_from_row(row: &PgRow) -> Result<Profile> {
    Ok(Profile {
        id: row.try_get("id").pg()?,
        key: row.try_get("key").pg()?,
        runner_type: runner_type(row)?,
        config: codec::decode_map_value("config", json(row, "config")?)?,
        default_timeout_minutes: row.try_get("default_timeout_minutes").pg()?,
        requires_approval: row.try_get("requires_approval").pg()?,
        created_at: row.try_get("created_at").pg()?,
        updated_at: row.try_get("updated_at").pg()?,
    })
}

pub(super) fn task_from_row(row: &PgRow) -> Result<Task> {
    let status: String = row.try_get("status").pg()?;
    Ok(Task {
        id: row.try_get("id").pg()?,
        title: row.try_get("title").pg()?,
        description: row.try_get("description").pg()?,
        scope_path: row.try_get("scope_path").pg()?,
        project_root: row.try_get("project_root").pg()?,
        status: TaskStatus::from_status(&status)
            .ok_or_else(|| Error::internal("column status holds an unknown task status"))?,
        created_by: row.try_get("created_by").pg()?,
        context: codec::decode_list_value("context", json(row, "context")?)?,
        created_at: row.try_get("created_at").pg()?,
        updated_at: row.try_get("updated_at").pg()?,
    })
}

pub(super) fn run_from_row(row: &PgRow) -> Result<Run> {
    let status: String = row.try_get("status").pg()?;
    let phase: String = row.try_get("phase").pg()?;
    Ok(Run {
        id: row.try_get("id").pg()?,
        task_id: row.try_get("task_id").pg()?,
        profile_id: row.try_get("profile_id").pg()?,
        runner_type: runner_type(row)?,
        resolved_config: codec::decode_object_value(
            "resolved_config",
            json(row, "resolved_config")?,
        )?,
        status: RunStatus::from_status(&status)
            .ok_or_else(|| Error::internal("column status holds an unknown run status"))?,
        phase: RunPhase::from_phase(&phase)
            .ok_or_else(|| Error::internal("column phase holds an unknown run phase"))?,
        idempotency_key: row.try_get("idempotency_key").pg()?,
        requires_approval: row.try_get("requires_approval").pg()?,
        timeout_ms: row.try_get("timeout_ms").pg()?,
        attempt: row.try_get("attempt").pg()?,
        parent_run_id: row.try_get("parent_run_id").pg()?,
        created_at: row.try_get("created_at").pg()?,
        updated_at: row.try_get("updated_at").pg()?,
        started_at: row.try_get("started_at").pg()?,
        ended_at: row.try_get("ended_at").pg()?,
        error_kind: row.try_get("error_kind").pg()?,
        error_message: row.try_get("error_message").pg()?,
        sandbox_id: row.try_get("sandbox_id").pg()?,
        summary: codec::decode_object_value("summary", json(row, "summary")?)?,
    })
}

pub(super) fn event_from_row(row: &PgRow) -> Result<RunEvent> {
    let event_type: String = row.try_get("event_type").pg()?;
    let payload = json(row, "payload")?.unwrap_or_else(|| Value::Object(Default::default()));
    Ok(RunEvent {
        id: row.try_get("id").pg()?,
        run_id: row.try_get("run_id").pg()?,
        seq: row.try_get("seq").pg()?,
        payload: EventPayload::from_columns(&event_type, payload).map_err(|e| {
            Error::internal(format!("event payload for {} is malformed", event_type)).with_source(e)
        })?,
        emitted_at: row.try_get("emitted_at").pg()?,
    })
}

pub(super) fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.try_get("id").pg()?,
        run_id: row.try_get("run_id").pg()?,
        label: row.try_get("label").pg()?,
        snapshot: json(row, "snapshot")?.unwrap_or_else(|| Value::Object(Default::default())),
        created_at: row.try_get("created_at").pg()?,
    })
}

pub(super) fn idempotency_from_row(row: &PgRow) -> Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        key: row.try_get("key").pg()?,
        fingerprint: row.try_get("fingerprint").pg()?,
        run_id: row.try_get("run_id").pg()?,
        first_seen_at: row.try_get("first_seen_at").pg()?,
        expires_at: row.try_get("expires_at").pg()?,
    })
}

pub(super) fn policy_from_row(row: &PgRow) -> Result<Policy> {
    let rules: Option<PolicyRules> = codec::decode_object_value("rules", json(row, "rules")?)?;
    Ok(Policy {
        id: row.try_get("id").pg()?,
        key: row.try_get("key").pg()?,
        rules: rules.unwrap_or_default(),
        updated_at: row.try_get("updated_at").pg()?,
    })
}

pub(super) fn lock_from_row(row: &PgRow) -> Result<Lock> {
    Ok(Lock {
        name: row.try_get("name").pg()?,
        holder_id: row.try_get("holder_id").pg()?,
        acquired_at: row.try_get("acquired_at").pg()?,
        expires_at: row.try_get("expires_at").pg()?,
    })
}

pub(super) fn diff_from_row(row: &PgRow) -> Result<DiffArtifact> {
    let stats: Option<DiffStats> = codec::decode_object_value("stats", json(row, "stats")?)?;
    Ok(DiffArtifact {
        id: row.try_get("id").pg()?,
        run_id: row.try_get("run_id").pg()?,
        sandbox_id: row.try_get("sandbox_id").pg()?,
        unified_diff: row.try_get("unified_diff").pg()?,
        files: codec::decode_list_value("files", json(row, "files")?)?,
        stats: stats.unwrap_or_default(),
        generated_at: row.try_get("generated_at").pg()?,
    })
}
