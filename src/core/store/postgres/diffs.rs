use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::rows::{DIFF_COLUMNS, diff_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Result, ResultExt};
use crate::core::model::{Diff, DiffArtifact, DiffStats};
use crate::core::store::DiffRepo;
use crate::core::store::codec::list_value;

#[async_trait]
impl DiffRepo for PgStore {
    async fn save_diff(&self, run_id: Uuid, sandbox_id: &str, diff: &Diff) -> Result<DiffArtifact> {
        let files = list_value(Some(diff.files.as_slice()))?;
        let stats = serde_json::to_value(DiffStats::from_files(&diff.files))?;
        let row = sqlx::query(&format!(
            "INSERT INTO run_diffs (run_id, sandbox_id, unified_diff, files, stats, generated_at)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            DIFF_COLUMNS
        ))
        .bind(run_id)
        .bind(sandbox_id)
        .bind(&diff.unified_diff)
        .bind(files)
        .bind(stats)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .pg()
        .op_context("save", "diff", Some(run_id.to_string()))?;
        diff_from_row(&row)
    }

    async fn latest_diff(&self, run_id: Uuid) -> Result<Option<DiffArtifact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM run_diffs WHERE run_id = $1 ORDER BY id DESC LIMIT 1",
            DIFF_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .pg()
        .op_context("get", "diff", Some(run_id.to_string()))?;
        row.as_ref().map(diff_from_row).transpose()
    }
}
