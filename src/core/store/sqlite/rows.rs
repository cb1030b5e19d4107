use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::ValueRef;
use uuid::Uuid;

use super::SqlResultExt;
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

fn text(row: &Row<'_>, col: &str) -> Result<String> {
    row.get(col).sql()
}

fn opt_text(row: &Row<'_>, col: &str) -> Result<Option<String>> {
    row.get(col).sql()
}

fn int(row: &Row<'_>, col: &str) -> Result<i64> {
    row.get(col).sql()
}

fn flag(row: &Row<'_>, col: &str) -> Result<bool> {
    Ok(int(row, col)? != 0)
}

fn id(row: &Row<'_>, col: &str) -> Result<Uuid> {
    let raw = text(row, col)?;
    parse_uuid(col, &raw)
}

fn opt_id(row: &Row<'_>, col: &str) -> Result<Option<Uuid>> {
    opt_text(row, col)?
        .map(|raw| parse_uuid(col, &raw))
        .transpose()
}

fn parse_uuid(col: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| Error::internal(format!("column {} holds a malformed id", col)).with_source(e))
}

fn ts(row: &Row<'_>, col: &str) -> Result<DateTime<Utc>> {
    codec::decode_ts(col, &text(row, col)?)
}

fn opt_ts(row: &Row<'_>, col: &str) -> Result<Option<DateTime<Utc>>> {
    codec::decode_opt_ts(col, opt_text(row, col)?.as_deref())
}

/// JSON columns may come back as TEXT or BLOB depending on who wrote them.
fn json(row: &Row<'_>, col: &str) -> Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(col).sql()? {
        ValueRef::Null => None,
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(bytes.to_vec()),
        ValueRef::Integer(i) => Some(i.to_string().into_bytes()),
        ValueRef::Real(f) => Some(f.to_string().into_bytes()),
    })
}

fn runner_type(row: &Row<'_>, col: &str) -> Result<RunnerType> {
    let raw = text(row, col)?;
    RunnerType::from_tag(&raw)
        .ok_or_else(|| Error::internal(format!("column {} holds an unknown runner type", col)))
}

pub(super) fn profile_from_row(row: &Row<'_>) -> Result<Profile> {
    Ok(Profile {
        id: id(row, "id")?,
        key: text(row, "key")?,
        runner_type: runner_type(row, "runner_type")?,
        config: codec::decode_map("config", json(row, "config")?.as_deref())?,
        default_timeout_minutes: int(row, "default_timeout_minutes")?,
        requires_approval: flag(row, "requires_approval")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

pub(super) fn task_from_row(row: &Row<'_>) -> Result<Task> {
    let status = text(row, "status")?;
    Ok(Task {
        id: id(row, "id")?,
        title: text(row, "title")?,
        description: text(row, "description")?,
        scope_path: text(row, "scope_path")?,
        project_root: text(row, "project_root")?,
        status: TaskStatus::from_status(&status)
            .ok_or_else(|| Error::internal("column status holds an unknown task status"))?,
        created_by: text(row, "created_by")?,
        context: codec::decode_list("context", json(row, "context")?.as_deref())?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

pub(super) fn run_from_row(row: &Row<'_>) -> Result<Run> {
    let status = text(row, "status")?;
    let phase = text(row, "phase")?;
    Ok(Run {
        id: id(row, "id")?,
        task_id: id(row, "task_id")?,
        profile_id: opt_id(row, "profile_id")?,
        runner_type: runner_type(row, "runner_type")?,
        resolved_config: codec::decode_object(
            "resolved_config",
            json(row, "resolved_config")?.as_deref(),
        )?,
        status: RunStatus::from_status(&status)
            .ok_or_else(|| Error::internal("column status holds an unknown run status"))?,
        phase: RunPhase::from_phase(&phase)
            .ok_or_else(|| Error::internal("column phase holds an unknown run phase"))?,
        idempotency_key: opt_text(row, "idempotency_key")?,
        requires_approval: flag(row, "requires_approval")?,
        timeout_ms: int(row, "timeout_ms")?,
        attempt: int(row, "attempt")? as i32,
        parent_run_id: opt_id(row, "parent_run_id")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
        started_at: opt_ts(row, "started_at")?,
        ended_at: opt_ts(row, "ended_at")?,
        error_kind: opt_text(row, "error_kind")?,
        error_message: opt_text(row, "error_message")?,
        sandbox_id: opt_text(row, "sandbox_id")?,
        summary: codec::decode_object("summary", json(row, "summary")?.as_deref())?,
    })
}

pub(super) fn event_from_row(row: &Row<'_>) -> Result<RunEvent> {
    let event_type = text(row, "event_type")?;
    let payload = codec::decode_value("payload", json(row, "payload")?.as_deref())?;
    Ok(RunEvent {
        id: int(row, "id")?,
        run_id: id(row, "run_id")?,
        seq: int(row, "seq")?,
        payload: EventPayload::from_columns(&event_type, payload).map_err(|e| {
            Error::internal(format!("event payload for {} is malformed", event_type)).with_source(e)
        })?,
        emitted_at: ts(row, "emitted_at")?,
    })
}

pub(super) fn checkpoint_from_row(row: &Row<'_>) -> Result<Checkpoint> {
    Ok(Checkpoint {
        id: id(row, "id")?,
        run_id: id(row, "run_id")?,
        label: text(row, "label")?,
        snapshot: codec::decode_value("snapshot", json(row, "snapshot")?.as_deref())?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn idempotency_from_row(row: &Row<'_>) -> Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        key: text(row, "key")?,
        fingerprint: text(row, "fingerprint")?,
        run_id: id(row, "run_id")?,
        first_seen_at: ts(row, "first_seen_at")?,
        expires_at: ts(row, "expires_at")?,
    })
}

pub(super) fn policy_from_row(row: &Row<'_>) -> Result<Policy> {
    let rules: Option<PolicyRules> =
        codec::decode_object("rules", json(row, "rules")?.as_deref())?;
    Ok(Policy {
        id: id(row, "id")?,
        key: text(row, "key")?,
        rules: rules.unwrap_or_default(),
        updated_at: ts(row, "updated_at")?,
    })
}

pub(super) fn lock_from_row(row: &Row<'_>) -> Result<Lock> {
    Ok(Lock {
        name: text(row, "name")?,
        holder_id: text(row, "holder_id")?,
        acquired_at: ts(row, "acquired_at")?,
        expires_at: ts(row, "expires_at")?,
    })
}

pub(super) fn diff_from_row(row: &Row<'_>) -> Result<DiffArtifact> {
    let stats: Option<DiffStats> = codec::decode_object("stats", json(row, "stats")?.as_deref())?;
    Ok(DiffArtifact {
        id: int(row, "id")?,
        run_id: id(row, "run_id")?,
        sandbox_id: text(row, "sandbox_id")?,
        unified_diff: text(row, "unified_diff")?,
        files: codec::decode_list("files", json(row, "files")?.as_deref())?,
        stats: stats.unwrap_or_default(),
        generated_at: ts(row, "generated_at")?,
    })
}

/// Collect every row of `stmt` through `decode`.
pub(super) fn collect<T, P>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
    decode: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>>
where
    P: rusqlite::Params,
{
    let mut rows = stmt.query(params).sql()?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().sql()? {
        out.push(decode(row)?);
    }
    Ok(out)
}

/// First row of `stmt`, if any.
pub(super) fn first<T, P>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
    decode: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Option<T>>
where
    P: rusqlite::Params,
{
    let mut rows = stmt.query(params).sql()?;
    match rows.next().sql()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}
