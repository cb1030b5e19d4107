use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use uuid::Uuid;

use super::events::append_events;
use super::idempotency::bind_key;
use super::rows::{RUN_COLUMNS, collect, first, run_from_row};
use super::tasks::{active_run_count, insert_task, load_task, set_task_status};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{
    EventPayload, Page, Run, RunFilter, RunPhase, RunStatus, TaskStatus,
};
use crate::core::store::codec::{encode_object, encode_opt_ts, encode_ts};
use crate::core::store::{
    Binding, CreateRunOutcome, NewRun, RunRepo, RunTransition, TaskSource, TransitionOutcome,
    check_transition,
};

pub(super) fn load_run(conn: &Connection, id: Uuid) -> Result<Run> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
        .sql()?;
    first(&mut stmt, params![id.to_string()], run_from_row)?
        .ok_or_else(|| Error::not_found("run", id))
}

fn create_run_tx(
    conn: &Connection,
    run_id: Uuid,
    now: DateTime<Utc>,
    new: NewRun,
) -> Result<CreateRunOutcome> {
    if let Some(claim) = &new.idempotency {
        match bind_key(conn, &claim.key, &claim.fingerprint, run_id, claim.ttl, now)? {
            Binding::Bound(_) => {}
            Binding::Existing(record) => {
                return Ok(CreateRunOutcome::Existing {
                    run: load_run(conn, record.run_id)?,
                });
            }
            Binding::Mismatch(_) => {
                return Err(Error::conflict(format!(
                    "idempotency key '{}' is bound to a different request",
                    claim.key
                )));
            }
        }
    }

    let task = match &new.task {
        TaskSource::New(task) => insert_task(conn, Uuid::new_v4(), now, task)?,
        TaskSource::Existing(task_id) => {
            let task = load_task(conn, *task_id)?;
            if active_run_count(conn, task.id)? > 0 {
                return Err(Error::conflict(format!(
                    "task {} already has a run in progress",
                    task.id
                )));
            }
            task
        }
    };

    let resolved = encode_object(Some(&new.resolved_config))?;
    conn.execute(
        "INSERT INTO runs (id, task_id, profile_id, runner_type, resolved_config, status, phase,
         idempotency_key, requires_approval, timeout_ms, attempt, parent_run_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            run_id.to_string(),
            task.id.to_string(),
            new.profile_id.map(|id| id.to_string()),
            new.runner_type.as_str(),
            resolved,
            RunStatus::Pending.as_str(),
            RunPhase::Queued.as_str(),
            new.idempotency.as_ref().map(|c| c.key.clone()),
            new.requires_approval,
            new.timeout_ms,
            new.attempt,
            new.parent_run_id.map(|id| id.to_string()),
            encode_ts(&now)
        ],
    )
    .sql()?;

    append_events(
        conn,
        run_id,
        &[EventPayload::RunCreated {
            task_id: task.id,
            runner_type: new.runner_type,
            attempt: new.attempt,
            parent_run_id: new.parent_run_id,
        }],
        now,
    )?;
    set_task_status(conn, task.id, TaskStatus::Queued, now)?;

    Ok(CreateRunOutcome::Created {
        run: load_run(conn, run_id)?,
        task: load_task(conn, task.id)?,
    })
}

fn transition_tx(
    conn: &Connection,
    t: &RunTransition,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let current = load_run(conn, t.run_id)?;
    check_transition(&current, t)?;

    let summary = encode_object(t.patch.summary.as_ref())?;
    conn.execute(
        "UPDATE runs SET status = ?2, phase = ?3, updated_at = ?4,
         started_at = COALESCE(?5, started_at),
         ended_at = COALESCE(?6, ended_at),
         error_kind = COALESCE(?7, error_kind),
         error_message = COALESCE(?8, error_message),
         sandbox_id = COALESCE(?9, sandbox_id),
         summary = COALESCE(?10, summary)
         WHERE id = ?1",
        params![
            t.run_id.to_string(),
            t.to_status.as_str(),
            t.to_phase.as_str(),
            encode_ts(&now),
            encode_opt_ts(t.patch.started_at.as_ref()),
            encode_opt_ts(t.patch.ended_at.as_ref()),
            t.patch.error_kind,
            t.patch.error_message,
            t.patch.sandbox_id,
            summary
        ],
    )
    .sql()?;

    if current.status != t.to_status || t.task_status.is_some() {
        let status = t
            .task_status
            .unwrap_or_else(|| TaskStatus::mirror(t.to_status));
        set_task_status(conn, current.task_id, status, now)?;
    }

    let events = append_events(conn, t.run_id, &t.events, now)?;
    Ok(TransitionOutcome {
        run: load_run(conn, t.run_id)?,
        events,
    })
}

#[async_trait]
impl RunRepo for SqliteStore {
    async fn create_run(&self, new: NewRun) -> Result<CreateRunOutcome> {
        let run_id = Uuid::new_v4();
        self.with_tx(move |conn| create_run_tx(conn, run_id, Utc::now(), new))
            .await
            .op_context("create", "run", Some(run_id.to_string()))
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.with_conn(|conn| load_run(conn, id))
            .await
            .op_context("get", "run", Some(id.to_string()))
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<Run>> {
        let (limit, offset) = page.resolve()?;
        let mut sql = format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS);
        let mut args: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", marks));
            args.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if let Some(runner) = filter.runner_type {
            sql.push_str(" AND runner_type = ?");
            args.push(Value::Text(runner.as_str().to_string()));
        }
        if let Some(task_id) = filter.task_id {
            sql.push_str(" AND task_id = ?");
            args.push(Value::Text(task_id.to_string()));
        }
        if let Some(after) = filter.created_after {
            sql.push_str(" AND created_at >= ?");
            args.push(Value::Text(encode_ts(&after)));
        }
        if let Some(before) = filter.created_before {
            sql.push_str(" AND created_at < ?");
            args.push(Value::Text(encode_ts(&before)));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        args.push(Value::Integer(limit));
        args.push(Value::Integer(offset));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).sql()?;
            collect(&mut stmt, params_from_iter(args.iter()), run_from_row)
        })
        .await
        .op_context("list", "run", None)
    }

    async fn transition_run(&self, transition: RunTransition) -> Result<TransitionOutcome> {
        let run_id = transition.run_id;
        self.with_tx(move |conn| transition_tx(conn, &transition, Utc::now()))
            .await
            .op_context("transition", "run", Some(run_id.to_string()))
    }

    async fn next_pending_runs(&self, limit: i64) -> Result<Vec<Run>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM runs WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT ?1",
                    RUN_COLUMNS
                ))
                .sql()?;
            collect(&mut stmt, params![limit.max(0)], run_from_row)
        })
        .await
        .op_context("list", "run", None)
    }

    async fn count_runs(&self, status: RunStatus) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .sql()
        })
        .await
        .op_context("count", "run", None)
    }
}
