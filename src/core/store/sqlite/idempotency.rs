use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::rows::{IDEMPOTENCY_COLUMNS, first, idempotency_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Result, ResultExt};
use crate::core::model::IdempotencyRecord;
use crate::core::store::codec::encode_ts;
use crate::core::store::{Binding, IdempotencyRepo};

fn load_record(conn: &Connection, key: &str) -> Result<Option<IdempotencyRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM idempotency_records WHERE key = ?1",
            IDEMPOTENCY_COLUMNS
        ))
        .sql()?;
    first(&mut stmt, params![key], idempotency_from_row)
}

/// Expired records count as absent and are replaced.
pub(super) fn bind_key(
    conn: &Connection,
    key: &str,
    fingerprint: &str,
    run_id: Uuid,
    ttl: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Binding> {
    if let Some(existing) = load_record(conn, key)? {
        if !existing.is_expired(now) {
            return Ok(if existing.fingerprint == fingerprint {
                Binding::Existing(existing)
            } else {
                Binding::Mismatch(existing)
            });
        }
        conn.execute(
            "DELETE FROM idempotency_records WHERE key = ?1",
            params![key],
        )
        .sql()?;
    }

    let record = IdempotencyRecord {
        key: key.to_string(),
        fingerprint: fingerprint.to_string(),
        run_id,
        first_seen_at: now,
        expires_at: now + ttl,
    };
    conn.execute(
        "INSERT INTO idempotency_records (key, fingerprint, run_id, first_seen_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.key,
            record.fingerprint,
            record.run_id.to_string(),
            encode_ts(&record.first_seen_at),
            encode_ts(&record.expires_at)
        ],
    )
    .sql()?;
    Ok(Binding::Bound(record))
}

#[async_trait]
impl IdempotencyRepo for SqliteStore {
    async fn bind_or_return(
        &self,
        key: &str,
        fingerprint: &str,
        run_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<Binding> {
        self.with_tx(|conn| bind_key(conn, key, fingerprint, run_id, ttl, Utc::now()))
            .await
            .op_context("bind", "idempotency_record", Some(key.to_string()))
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.with_conn(|conn| load_record(conn, key))
            .await
            .op_context("get", "idempotency_record", Some(key.to_string()))
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        self.with_tx(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM idempotency_records WHERE expires_at <= ?1",
                    params![encode_ts(&now)],
                )
                .sql()?;
            Ok(removed as u64)
        })
        .await
        .op_context("purge", "idempotency_record", None)
    }
}
