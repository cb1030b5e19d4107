use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::rows::{TASK_COLUMNS, collect, first, task_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{NewTask, Page, Task, TaskStatus};
use crate::core::store::TaskRepo;
use crate::core::store::codec::{encode_list, encode_ts};

pub(super) fn load_task(conn: &Connection, id: Uuid) -> Result<Task> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
        .sql()?;
    first(&mut stmt, params![id.to_string()], task_from_row)?
        .ok_or_else(|| Error::not_found("task", id))
}

pub(super) fn insert_task(
    conn: &Connection,
    id: Uuid,
    now: DateTime<Utc>,
    new: &NewTask,
) -> Result<Task> {
    let context = encode_list(Some(new.context.as_slice()))?;
    conn.execute(
        "INSERT INTO tasks (id, title, description, scope_path, project_root, status, created_by, context, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            id.to_string(),
            new.title,
            new.description,
            new.scope_path,
            new.project_root,
            TaskStatus::Queued.as_str(),
            new.created_by,
            context,
            encode_ts(&now)
        ],
    )
    .sql()?;
    load_task(conn, id)
}

pub(super) fn set_task_status(
    conn: &Connection,
    id: Uuid,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), status.as_str(), encode_ts(&now)],
    )
    .sql()?;
    Ok(())
}

pub(super) fn active_run_count(conn: &Connection, task_id: Uuid) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM runs WHERE task_id = ?1
         AND status IN ('pending', 'running', 'awaiting_approval')",
        params![task_id.to_string()],
        |row| row.get(0),
    )
    .sql()
}

#[async_trait]
impl TaskRepo for SqliteStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let id = Uuid::new_v4();
        self.with_tx(move |conn| insert_task(conn, id, Utc::now(), &new))
            .await
            .op_context("create", "task", Some(id.to_string()))
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.with_conn(|conn| load_task(conn, id))
            .await
            .op_context("get", "task", Some(id.to_string()))
    }

    async fn update_task(&self, task: &Task) -> Result<Task> {
        let task = task.clone();
        let id = task.id;
        let context = encode_list(Some(task.context.as_slice()))?;
        self.with_tx(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET title = ?2, description = ?3, scope_path = ?4, project_root = ?5,
                     status = ?6, context = ?7, updated_at = ?8 WHERE id = ?1",
                    params![
                        id.to_string(),
                        task.title,
                        task.description,
                        task.scope_path,
                        task.project_root,
                        task.status.as_str(),
                        context,
                        encode_ts(&Utc::now())
                    ],
                )
                .sql()?;
            if changed == 0 {
                return Err(Error::not_found("task", id));
            }
            load_task(conn, id)
        })
        .await
        .op_context("update", "task", Some(id.to_string()))
    }

    async fn list_tasks(&self, page: Page) -> Result<Vec<Task>> {
        let (limit, offset) = page.resolve()?;
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    TASK_COLUMNS
                ))
                .sql()?;
            collect(&mut stmt, params![limit, offset], task_from_row)
        })
        .await
        .op_context("list", "task", None)
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.with_tx(move |conn| {
            load_task(conn, id)?;
            if active_run_count(conn, id)? > 0 {
                return Err(Error::conflict(format!("task {} has an active run", id)));
            }
            conn.execute(
                "DELETE FROM idempotency_records WHERE run_id IN (SELECT id FROM runs WHERE task_id = ?1)",
                params![id.to_string()],
            )
            .sql()?;
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .sql()?;
            Ok(())
        })
        .await
        .op_context("delete", "task", Some(id.to_string()))
    }
}
