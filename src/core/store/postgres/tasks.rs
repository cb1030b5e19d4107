use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use super::rows::{TASK_COLUMNS, task_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{NewTask, Page, Task, TaskStatus};
use crate::core::store::TaskRepo;
use crate::core::store::codec::list_value;

pub(super) async fn load_task(conn: &mut PgConnection, id: Uuid) -> Result<Task> {
    let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .pg()?;
    match row {
        Some(row) => task_from_row(&row),
        None => Err(Error::not_found("task", id)),
    }
}

pub(super) async fn insert_task(
    conn: &mut PgConnection,
    id: Uuid,
    now: DateTime<Utc>,
    new: &NewTask,
) -> Result<Task> {
    sqlx::query(
        "INSERT INTO tasks (id, title, description, scope_path, project_root, status, created_by, context, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
    )
    .bind(id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.scope_path)
    .bind(&new.project_root)
    .bind(TaskStatus::Queued.as_str())
    .bind(&new.created_by)
    .bind(list_value(Some(new.context.as_slice()))?)
    .bind(now)
    .execute(&mut *conn)
    .await
    .pg()?;
    load_task(conn, id).await
}

pub(super) async fn set_task_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .pg()?;
    Ok(())
}

pub(super) async fn active_run_count(conn: &mut PgConnection, task_id: Uuid) -> Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM runs WHERE task_id = $1
         AND status IN ('pending', 'running', 'awaiting_approval')",
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await
    .pg()
}

#[async_trait]
impl TaskRepo for PgStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let id = Uuid::new_v4();
        let res: Result<Task> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let task = insert_task(&mut tx, id, Utc::now(), &new).await?;
            tx.commit().await.pg()?;
            Ok(task)
        }
        .await;
        res.op_context("create", "task", Some(id.to_string()))
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        let res: Result<Task> = async {
            let mut conn = self.pool.acquire().await.pg()?;
            load_task(&mut conn, id).await
        }
        .await;
        res.op_context("get", "task", Some(id.to_string()))
    }

    async fn update_task(&self, task: &Task) -> Result<Task> {
        let id = task.id;
        let res: Result<Task> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let changed = sqlx::query(
                "UPDATE tasks SET title = $2, description = $3, scope_path = $4, project_root = $5,
                 status = $6, context = $7, updated_at = $8 WHERE id = $1",
            )
            .bind(id)
            .bind(&task.title)
            .bind(&task.description)
            .bind(&task.scope_path)
            .bind(&task.project_root)
            .bind(task.status.as_str())
            .bind(list_value(Some(task.context.as_slice()))?)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .pg()?
            .rows_affected();
            if changed == 0 {
                return Err(Error::not_found("task", id));
            }
            let task = load_task(&mut tx, id).await?;
            tx.commit().await.pg()?;
            Ok(task)
        }
        .await;
        res.op_context("update", "task", Some(id.to_string()))
    }

    async fn list_tasks(&self, page: Page) -> Result<Vec<Task>> {
        let (limit, offset) = page.resolve()?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
            TASK_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "task", None)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        let res: Result<()> = async {
            let mut tx = self.pool.begin().await.pg()?;
            sqlx::query("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .pg()?
                .ok_or_else(|| Error::not_found("task", id))?;
            if active_run_count(&mut tx, id).await? > 0 {
                return Err(Error::conflict(format!("task {} has an active run", id)));
            }
            sqlx::query(
                "DELETE FROM idempotency_records WHERE run_id IN (SELECT id FROM runs WHERE task_id = $1)",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .pg()?;
            sqlx::query("DELETE FROM tasks WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .pg()?;
            tx.commit().await.pg()?;
            Ok(())
        }
        .await;
        res.op_context("delete", "task", Some(id.to_string()))
    }
}
