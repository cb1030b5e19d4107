use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};

use super::rows::{LOCK_COLUMNS, first, lock_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::Lock;
use crate::core::store::LockRepo;
use crate::core::store::codec::encode_ts;

fn load_lock(conn: &Connection, name: &str) -> Result<Option<Lock>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM locks WHERE name = ?1", LOCK_COLUMNS))
        .sql()?;
    first(&mut stmt, params![name], lock_from_row)
}

#[async_trait]
impl LockRepo for SqliteStore {
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lock>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::invalid_args("lock ttl is out of range").with_source(e))?;
        self.with_tx(|conn| {
            let now = Utc::now();
            let changed = conn
                .execute(
                    "INSERT INTO locks (name, holder_id, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(name) DO UPDATE SET
                         holder_id = excluded.holder_id,
                         acquired_at = excluded.acquired_at,
                         expires_at = excluded.expires_at
                     WHERE locks.expires_at <= ?3 OR locks.holder_id = excluded.holder_id",
                    params![name, holder, encode_ts(&now), encode_ts(&(now + ttl))],
                )
                .sql()?;
            if changed == 0 {
                return Ok(None);
            }
            load_lock(conn, name)
        })
        .await
        .op_context("acquire", "lock", Some(name.to_string()))
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        self.with_tx(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM locks WHERE name = ?1 AND holder_id = ?2",
                    params![name, holder],
                )
                .sql()?;
            Ok(removed > 0)
        })
        .await
        .op_context("release", "lock", Some(name.to_string()))
    }

    async fn try_reclaim_lock(&self, name: &str) -> Result<bool> {
        self.with_tx(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM locks WHERE name = ?1 AND expires_at <= ?2",
                    params![name, encode_ts(&Utc::now())],
                )
                .sql()?;
            Ok(removed > 0)
        })
        .await
        .op_context("reclaim", "lock", Some(name.to_string()))
    }

    async fn get_lock(&self, name: &str) -> Result<Option<Lock>> {
        self.with_conn(|conn| load_lock(conn, name))
            .await
            .op_context("get", "lock", Some(name.to_string()))
    }
}
