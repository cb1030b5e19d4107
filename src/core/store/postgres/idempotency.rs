use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use super::rows::{IDEMPOTENCY_COLUMNS, idempotency_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Result, ResultExt};
use crate::core::model::IdempotencyRecord;
use crate::core::store::{Binding, IdempotencyRepo};

/// `ON CONFLICT DO NOTHING` blocks on a concurrent uncommitted insert of
/// the same key, so the follow-up read sees the winner's record.
pub(super) async fn bind_key(
    conn: &mut PgConnection,
    key: &str,
    fingerprint: &str,
    run_id: Uuid,
    ttl: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Binding> {
    sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND expires_at <= $2")
        .bind(key)
        .bind(now)
        .execute(&mut *conn)
        .await
        .pg()?;

    let inserted = sqlx::query(&format!(
        "INSERT INTO idempotency_records (key, fingerprint, run_id, first_seen_at, expires_at)
         VALUES ($1, $2, $3, $4, $5) ON CONFLICT (key) DO NOTHING RETURNING {}",
        IDEMPOTENCY_COLUMNS
    ))
    .bind(key)
    .bind(fingerprint)
    .bind(run_id)
    .bind(now)
    .bind(now + ttl)
    .fetch_optional(&mut *conn)
    .await
    .pg()?;
    if let Some(row) = inserted {
        return Ok(Binding::Bound(idempotency_from_row(&row)?));
    }

    let row = sqlx::query(&format!(
        "SELECT {} FROM idempotency_records WHERE key = $1",
        IDEMPOTENCY_COLUMNS
    ))
    .bind(key)
    .fetch_one(&mut *conn)
    .await
    .pg()?;
    let existing = idempotency_from_row(&row)?;
    Ok(if existing.fingerprint == fingerprint {
        Binding::Existing(existing)
    } else {
        Binding::Mismatch(existing)
    })
}

#[async_trait]
impl IdempotencyRepo for PgStore {
    async fn bind_or_return(
        &self,
        key: &str,
        fingerprint: &str,
        run_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<Binding> {
        let res: Result<Binding> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let binding = bind_key(&mut tx, key, fingerprint, run_id, ttl, Utc::now()).await?;
            tx.commit().await.pg()?;
            Ok(binding)
        }
        .await;
        res.op_context("bind", "idempotency_record", Some(key.to_string()))
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1",
            IDEMPOTENCY_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .pg()
        .op_context("get", "idempotency_record", Some(key.to_string()))?;
        row.as_ref().map(idempotency_from_row).transpose()
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|res| res.rows_affected())
            .pg()
            .op_context("purge", "idempotency_record", None)
    }
}
