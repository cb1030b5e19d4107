use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::rows::{DIFF_COLUMNS, first, diff_from_row};
use super::runs::load_run;
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Diff, DiffArtifact, DiffStats};
use crate::core::store::DiffRepo;
use crate::core::store::codec::{encode_list, encode_ts};

#[async_trait]
impl DiffRepo for SqliteStore {
    async fn save_diff(&self, run_id: Uuid, sandbox_id: &str, diff: &Diff) -> Result<DiffArtifact> {
        let files = encode_list(Some(diff.files.as_slice()))?;
        let stats = serde_json::to_string(&DiffStats::from_files(&diff.files))?;
        let unified = diff.unified_diff.clone();
        self.with_tx(move |conn| {
            load_run(conn, run_id)?;
            conn.execute(
                "INSERT INTO run_diffs (run_id, sandbox_id, unified_diff, files, stats, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    sandbox_id,
                    unified,
                    files,
                    stats,
                    encode_ts(&Utc::now())
                ],
            )
            .sql()?;
            let id = conn.last_insert_rowid();
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM run_diffs WHERE id = ?1", DIFF_COLUMNS))
                .sql()?;
            first(&mut stmt, params![id], diff_from_row)?
                .ok_or_else(|| Error::internal("diff was not stored"))
        })
        .await
        .op_context("save", "diff", Some(run_id.to_string()))
    }

    async fn latest_diff(&self, run_id: Uuid) -> Result<Option<DiffArtifact>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM run_diffs WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                    DIFF_COLUMNS
                ))
                .sql()?;
            first(&mut stmt, params![run_id.to_string()], diff_from_row)
        })
        .await
        .op_context("get", "diff", Some(run_id.to_string()))
    }
}
