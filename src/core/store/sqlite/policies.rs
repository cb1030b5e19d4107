use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::rows::{POLICY_COLUMNS, collect, first, policy_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Page, Policy, PolicyRules};
use crate::core::store::PolicyRepo;
use crate::core::store::codec::encode_ts;

#[async_trait]
impl PolicyRepo for SqliteStore {
    async fn upsert_policy(&self, key: &str, rules: &PolicyRules) -> Result<Policy> {
        if key.trim().is_empty() {
            return Err(Error::invalid_args("policy key must not be empty"));
        }
        let body = serde_json::to_string(rules)?;
        self.with_tx(move |conn| {
            conn.execute(
                "INSERT INTO policies (id, key, rules, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET rules = excluded.rules, updated_at = excluded.updated_at",
                params![Uuid::new_v4().to_string(), key, body, encode_ts(&Utc::now())],
            )
            .sql()?;
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM policies WHERE key = ?1", POLICY_COLUMNS))
                .sql()?;
            first(&mut stmt, params![key], policy_from_row)?
                .ok_or_else(|| Error::internal("policy was not stored"))
        })
        .await
        .op_context("upsert", "policy", Some(key.to_string()))
    }

    async fn get_policy(&self, key: &str) -> Result<Option<Policy>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM policies WHERE key = ?1", POLICY_COLUMNS))
                .sql()?;
            first(&mut stmt, params![key], policy_from_row)
        })
        .await
        .op_context("get", "policy", Some(key.to_string()))
    }

    async fn list_policies(&self, page: Page) -> Result<Vec<Policy>> {
        let (limit, offset) = page.resolve()?;
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM policies ORDER BY key ASC LIMIT ?1 OFFSET ?2",
                    POLICY_COLUMNS
                ))
                .sql()?;
            collect(&mut stmt, params![limit, offset], policy_from_row)
        })
        .await
        .op_context("list", "policy", None)
    }
}
