use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::rows::{LOCK_COLUMNS, lock_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::Lock;
use crate::core::store::LockRepo;

#[async_trait]
impl LockRepo for PgStore {
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lock>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::invalid_args("lock ttl is out of range").with_source(e))?;
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO locks (name, holder_id, acquired_at, expires_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE SET
                 holder_id = EXCLUDED.holder_id,
                 acquired_at = EXCLUDED.acquired_at,
                 expires_at = EXCLUDED.expires_at
             WHERE locks.expires_at <= $3 OR locks.holder_id = EXCLUDED.holder_id
             RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .fetch_optional(&self.pool)
        .await
        .pg()
        .op_context("acquire", "lock", Some(name.to_string()))?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        sqlx::query("DELETE FROM locks WHERE name = $1 AND holder_id = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map(|res| res.rows_affected() > 0)
            .pg()
            .op_context("release", "lock", Some(name.to_string()))
    }

    async fn try_reclaim_lock(&self, name: &str) -> Result<bool> {
        sqlx::query("DELETE FROM locks WHERE name = $1 AND expires_at <= $2")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|res| res.rows_affected() > 0)
            .pg()
            .op_context("reclaim", "lock", Some(name.to_string()))
    }

    async fn get_lock(&self, name: &str) -> Result<Option<Lock>> {
        let row = sqlx::query(&format!("SELECT {} FROM locks WHERE name = $1", LOCK_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .pg()
            .op_context("get", "lock", Some(name.to_string()))?;
        row.as_ref().map(lock_from_row).transpose()
    }
}
