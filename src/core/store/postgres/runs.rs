use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, Postgres};
use sqlx::QueryBuilder;
use uuid::Uuid;

use super::events::append_events;
use super::idempotency::bind_key;
use super::rows::{RUN_COLUMNS, run_from_row};
use super::tasks::{active_run_count, insert_task, load_task, set_task_status};
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{EventPayload, Page, Run, RunFilter, RunPhase, RunStatus, TaskStatus};
use crate::core::store::codec::object_value;
use crate::core::store::{
    Binding, CreateRunOutcome, NewRun, RunRepo, RunTransition, TaskSource, TransitionOutcome,
    check_transition,
};

pub(super) async fn load_run(conn: &mut PgConnection, id: Uuid) -> Result<Run> {
    let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = $1", RUN_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .pg()?;
    match row {
        Some(row) => run_from_row(&row),
        None => Err(Error::not_found("run", id)),
    }
}

/// Row-lock the run for the rest of the transaction. Every writer that
/// allocates event sequence numbers goes through here first.
pub(super) async fn lock_run(conn: &mut PgConnection, id: Uuid) -> Result<Run> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM runs WHERE id = $1 FOR UPDATE",
        RUN_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .pg()?;
    match row {
        Some(row) => run_from_row(&row),
        None => Err(Error::not_found("run", id)),
    }
}

async fn create_run_tx(
    conn: &mut PgConnection,
    run_id: Uuid,
    now: DateTime<Utc>,
    new: &NewRun,
) -> Result<CreateRunOutcome> {
    if let Some(claim) = &new.idempotency {
        match bind_key(conn, &claim.key, &claim.fingerprint, run_id, claim.ttl, now).await? {
            Binding::Bound(_) => {}
            Binding::Existing(record) => {
                return Ok(CreateRunOutcome::Existing {
                    run: load_run(conn, record.run_id).await?,
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
        TaskSource::New(task) => insert_task(conn, Uuid::new_v4(), now, task).await?,
        TaskSource::Existing(task_id) => {
            sqlx::query("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(*task_id)
                .fetch_optional(&mut *conn)
                .await
                .pg()?
                .ok_or_else(|| Error::not_found("task", task_id))?;
            if active_run_count(conn, *task_id).await? > 0 {
                return Err(Error::conflict(format!(
                    "task {} already has a run in progress",
                    task_id
                )));
            }
            load_task(conn, *task_id).await?
        }
    };

    sqlx::query(
        "INSERT INTO runs (id, task_id, profile_id, runner_type, resolved_config, status, phase,
         idempotency_key, requires_approval, timeout_ms, attempt, parent_run_id, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)",
    )
    .bind(run_id)
    .bind(task.id)
    .bind(new.profile_id)
    .bind(new.runner_type.as_str())
    .bind(object_value(Some(&new.resolved_config))?)
    .bind(RunStatus::Pending.as_str())
    .bind(RunPhase::Queued.as_str())
    .bind(new.idempotency.as_ref().map(|c| c.key.clone()))
    .bind(new.requires_approval)
    .bind(new.timeout_ms)
    .bind(new.attempt)
    .bind(new.parent_run_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .pg()?;

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
    )
    .await?;
    set_task_status(conn, task.id, TaskStatus::Queued, now).await?;

    Ok(CreateRunOutcome::Created {
        run: load_run(conn, run_id).await?,
        task: load_task(conn, task.id).await?,
    })
}

async fn transition_tx(
    conn: &mut PgConnection,
    t: &RunTransition,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let current = lock_run(conn, t.run_id).await?;
    check_transition(&current, t)?;

    sqlx::query(
        "UPDATE runs SET status = $2, phase = $3, updated_at = $4,
         started_at = COALESCE($5, started_at),
         ended_at = COALESCE($6, ended_at),
         error_kind = COALESCE($7, error_kind),
         error_message = COALESCE($8, error_message),
         sandbox_id = COALESCE($9, sandbox_id),
         summary = COALESCE($10, summary)
         WHERE id = $1",
    )
    .bind(t.run_id)
    .bind(t.to_status.as_str())
    .bind(t.to_phase.as_str())
    .bind(now)
    .bind(t.patch.started_at)
    .bind(t.patch.ended_at)
    .bind(t.patch.error_kind.as_deref())
    .bind(t.patch.error_message.as_deref())
    .bind(t.patch.sandbox_id.as_deref())
    .bind(object_value(t.patch.summary.as_ref())?)
    .execute(&mut *conn)
    .await
    .pg()?;

    if current.status != t.to_status || t.task_status.is_some() {
        let status = t
            .task_status
            .unwrap_or_else(|| TaskStatus::mirror(t.to_status));
        set_task_status(conn, current.task_id, status, now).await?;
    }

    let events = append_events(conn, t.run_id, &t.events, now).await?;
    Ok(TransitionOutcome {
        run: load_run(conn, t.run_id).await?,
        events,
    })
}

#[async_trait]
impl RunRepo for PgStore {
    async fn create_run(&self, new: NewRun) -> Result<CreateRunOutcome> {
        let run_id = Uuid::new_v4();
        let res: Result<CreateRunOutcome> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let outcome = create_run_tx(&mut tx, run_id, Utc::now(), &new).await?;
            tx.commit().await.pg()?;
            Ok(outcome)
        }
        .await;
        res.op_context("create", "run", Some(run_id.to_string()))
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        let res: Result<Run> = async {
            let mut conn = self.pool.acquire().await.pg()?;
            load_run(&mut conn, id).await
        }
        .await;
        res.op_context("get", "run", Some(id.to_string()))
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<Run>> {
        let (limit, offset) = page.resolve()?;
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS));
        if !filter.statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut sep = builder.separated(", ");
            for status in &filter.statuses {
                sep.push_bind(status.as_str());
            }
            sep.push_unseparated(")");
        }
        if let Some(runner) = filter.runner_type {
            builder.push(" AND runner_type = ").push_bind(runner.as_str());
        }
        if let Some(task_id) = filter.task_id {
            builder.push(" AND task_id = ").push_bind(task_id);
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at < ").push_bind(before);
        }
        builder
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .pg()
            .op_context("list", "run", None)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn transition_run(&self, transition: RunTransition) -> Result<TransitionOutcome> {
        let run_id = transition.run_id;
        let res: Result<TransitionOutcome> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let outcome = transition_tx(&mut tx, &transition, Utc::now()).await?;
            tx.commit().await.pg()?;
            Ok(outcome)
        }
        .await;
        res.op_context("transition", "run", Some(run_id.to_string()))
    }

    async fn next_pending_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT $1",
            RUN_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "run", None)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn count_runs(&self, status: RunStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .pg()
            .op_context("count", "run", None)
    }
}
