use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::events::append_events;
use super::rows::{CHECKPOINT_COLUMNS, checkpoint_from_row};
use super::runs::lock_run;
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Checkpoint, EventPayload};
use crate::core::store::CheckpointRepo;

#[async_trait]
impl CheckpointRepo for PgStore {
    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        label: &str,
        snapshot: serde_json::Value,
    ) -> Result<Checkpoint> {
        if label.trim().is_empty() {
            return Err(Error::invalid_args("checkpoint label must not be empty"));
        }
        let res: Result<Checkpoint> = async {
            let mut tx = self.pool.begin().await.pg()?;
            lock_run(&mut tx, run_id).await?;
            let now = Utc::now();
            let row = sqlx::query(&format!(
                "INSERT INTO checkpoints (id, run_id, label, snapshot, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (run_id, label) DO UPDATE SET
                     snapshot = EXCLUDED.snapshot,
                     created_at = EXCLUDED.created_at
                 RETURNING {}",
                CHECKPOINT_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(label)
            .bind(&snapshot)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .pg()?;
            let checkpoint = checkpoint_from_row(&row)?;
            append_events(
                &mut tx,
                run_id,
                &[EventPayload::CheckpointSaved {
                    label: label.to_string(),
                }],
                now,
            )
            .await?;
            tx.commit().await.pg()?;
            Ok(checkpoint)
        }
        .await;
        res.op_context("save", "checkpoint", Some(run_id.to_string()))
    }

    async fn get_checkpoint(&self, run_id: Uuid, label: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = $1 AND label = $2",
            CHECKPOINT_COLUMNS
        ))
        .bind(run_id)
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .pg()
        .op_context("get", "checkpoint", Some(run_id.to_string()))?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = $1 ORDER BY created_at ASC, label ASC",
            CHECKPOINT_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "checkpoint", Some(run_id.to_string()))?;
        rows.iter().map(checkpoint_from_row).collect()
    }
}
