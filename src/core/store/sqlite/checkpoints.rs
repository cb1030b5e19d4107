use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::events::append_events;
use super::rows::{CHECKPOINT_COLUMNS, collect, first, checkpoint_from_row};
use super::runs::load_run;
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Checkpoint, EventPayload};
use crate::core::store::CheckpointRepo;
use crate::core::store::codec::encode_ts;

#[async_trait]
impl CheckpointRepo for SqliteStore {
    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        label: &str,
        snapshot: serde_json::Value,
    ) -> Result<Checkpoint> {
        if label.trim().is_empty() {
            return Err(Error::invalid_args("checkpoint label must not be empty"));
        }
        let body = serde_json::to_string(&snapshot)?;
        self.with_tx(move |conn| {
            load_run(conn, run_id)?;
            let now = Utc::now();
            conn.execute(
                "INSERT INTO checkpoints (id, run_id, label, snapshot, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id, label) DO UPDATE SET
                     snapshot = excluded.snapshot,
                     created_at = excluded.created_at",
                params![
                    Uuid::new_v4().to_string(),
                    run_id.to_string(),
                    label,
                    body,
                    encode_ts(&now)
                ],
            )
            .sql()?;
            append_events(
                conn,
                run_id,
                &[EventPayload::CheckpointSaved {
                    label: label.to_string(),
                }],
                now,
            )?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 AND label = ?2",
                    CHECKPOINT_COLUMNS
                ))
                .sql()?;
            first(&mut stmt, params![run_id.to_string(), label], checkpoint_from_row)?
                .ok_or_else(|| Error::internal("checkpoint was not stored"))
        })
        .await
        .op_context("save", "checkpoint", Some(run_id.to_string()))
    }

    async fn get_checkpoint(&self, run_id: Uuid, label: &str) -> Result<Option<Checkpoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 AND label = ?2",
                    CHECKPOINT_COLUMNS
                ))
                .sql()?;
            first(&mut stmt, params![run_id.to_string(), label], checkpoint_from_row)
        })
        .await
        .op_context("get", "checkpoint", Some(run_id.to_string()))
    }

    async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY created_at ASC, label ASC",
                    CHECKPOINT_COLUMNS
                ))
                .sql()?;
            collect(&mut stmt, params![run_id.to_string()], checkpoint_from_row)
        })
        .await
        .op_context("list", "checkpoint", Some(run_id.to_string()))
    }
}
