use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::rows::{POLICY_COLUMNS, policy_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Page, Policy, PolicyRules};
use crate::core::store::PolicyRepo;

#[async_trait]
impl PolicyRepo for PgStore {
    async fn upsert_policy(&self, key: &str, rules: &PolicyRules) -> Result<Policy> {
        if key.trim().is_empty() {
            return Err(Error::invalid_args("policy key must not be empty"));
        }
        let body = serde_json::to_value(rules)?;
        let row = sqlx::query(&format!(
            "INSERT INTO policies (id, key, rules, updated_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (key) DO UPDATE SET rules = EXCLUDED.rules, updated_at = EXCLUDED.updated_at
             RETURNING {}",
            POLICY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .pg()
        .op_context("upsert", "policy", Some(key.to_string()))?;
        policy_from_row(&row)
    }

    async fn get_policy(&self, key: &str) -> Result<Option<Policy>> {
        let row = sqlx::query(&format!("SELECT {} FROM policies WHERE key = $1", POLICY_COLUMNS))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .pg()
            .op_context("get", "policy", Some(key.to_string()))?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_policies(&self, page: Page) -> Result<Vec<Policy>> {
        let (limit, offset) = page.resolve()?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM policies ORDER BY key ASC LIMIT $1 OFFSET $2",
            POLICY_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "policy", None)?;
        rows.iter().map(policy_from_row).collect()
    }
}
