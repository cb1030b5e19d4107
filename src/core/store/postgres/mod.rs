mod checkpoints;
mod diffs;
mod events;
mod idempotency;
mod locks;
mod policies;
mod profiles;
mod rows;
mod runs;
mod tasks;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{Backoff, Dialect, SCHEMA_VERSION, Store};
use crate::config::DbConfig;
use crate::core::error::{Error, ErrorKind, Result};

const SCHEMA: &str = include_str!("schema.sql");

/// Key for `pg_try_advisory_lock` while the schema is applied.
const SCHEMA_ADVISORY_KEY: i64 = 0x6167_656e_7463_6f72;

/// Server dialect on a sqlx connection pool. Multi-statement writes run in
/// a pool transaction; the run row is locked `FOR UPDATE` before sequence
/// numbers are allocated so concurrent appends serialize per run.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let url = cfg.server.connection_url();
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_open_conns.max(1))
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Duration::from_millis(cfg.conn_max_lifetime_ms))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(map_pg_err)?;

        let store = Self { pool };
        store.bootstrap(Backoff::from_db_config(cfg)).await?;
        Ok(store)
    }

    async fn bootstrap(&self, backoff: Backoff) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_pg_err)?;

        let mut attempt = 0;
        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(SCHEMA_ADVISORY_KEY)
                .fetch_one(&mut *conn)
                .await
                .map_err(map_pg_err)?;
            if locked {
                break;
            }
            if attempt + 1 >= backoff.attempts.max(5) {
                return Err(Error::transient("schema bootstrap is locked by another process"));
            }
            debug!("Schema advisory lock held elsewhere, waiting (attempt {})", attempt + 1);
            tokio::time::sleep(backoff.delay(attempt)).await;
            attempt += 1;
        }

        let applied = apply_schema(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_ADVISORY_KEY)
            .execute(&mut *conn)
            .await
            .map_err(map_pg_err)?;

        if applied? {
            info!("Applied server schema version {}", SCHEMA_VERSION);
        }
        Ok(())
    }
}

async fn apply_schema(conn: &mut PgConnection) -> Result<bool> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(map_pg_err)?;

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = $1")
            .bind(SCHEMA_VERSION)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_pg_err)?;
    if existing.is_some() {
        return Ok(false);
    }

    sqlx::raw_sql(SCHEMA)
        .execute(&mut *conn)
        .await
        .map_err(map_pg_err)?;
    sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES ($1, $2)")
        .bind(SCHEMA_VERSION)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(map_pg_err)?;
    Ok(true)
}

/// Driver errors never reach callers verbatim; the original stays attached
/// as the source for logs.
pub(crate) fn map_pg_err(err: sqlx::Error) -> Error {
    let (kind, message) = match &err {
        sqlx::Error::RowNotFound => (ErrorKind::NotFound, "record not found"),
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => (ErrorKind::Transient, "server store is unavailable"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => {
                (ErrorKind::Transient, "server store transaction was aborted")
            }
            Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                (ErrorKind::Transient, "server store is unavailable")
            }
            Some("23503") => (ErrorKind::NotFound, "referenced record not found"),
            Some(code) if code.starts_with("23") => {
                (ErrorKind::Conflict, "record conflicts with existing data")
            }
            _ => (ErrorKind::Internal, "storage operation failed"),
        },
        _ => (ErrorKind::Internal, "storage operation failed"),
    };
    Error::new(kind, message).with_source(err)
}

pub(crate) trait PgResultExt<T> {
    fn pg(self) -> Result<T>;
}

impl<T> PgResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn pg(self) -> Result<T> {
        self.map_err(map_pg_err)
    }
}

#[async_trait]
impl Store for PgStore {
    fn dialect(&self) -> Dialect {
        Dialect::Server
    }

    async fn health_check(&self) -> Result<()> {
        let check = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool);
        match tokio::time::timeout(Duration::from_secs(2), check).await {
            Ok(res) => res.map(|_| ()).pg(),
            Err(_) => Err(Error::transient("server store health check timed out")),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Server store closed");
    }
}
