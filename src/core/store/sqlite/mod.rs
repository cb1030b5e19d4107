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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::codec::encode_ts;
use super::{Backoff, Dialect, LockRepo, SCHEMA_LOCK, SCHEMA_VERSION, Store};
use crate::core::error::{Error, ErrorKind, Result};
use crate::platform::{NativePlatform, Platform};

const SCHEMA: &str = include_str!("schema.sql");

const BOOTSTRAP: &str = "
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    holder_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
";

/// Embedded dialect. One connection behind an async mutex: SQLite has a
/// single writer, so a larger pool would only trade lock waits for
/// `SQLITE_BUSY`.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
    holder_id: String,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        configure(&conn)?;
        NativePlatform::restrict_file_permissions(path);

        let store = Self {
            db: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            holder_id: format!("store-{}", uuid::Uuid::new_v4()),
        };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside an IMMEDIATE transaction. Returning `Err` (or
    /// panicking) drops the transaction, which rolls it back.
    pub(crate) async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let mut db = self.db.lock().await;
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(out)
    }

    /// Non-transactional read on the shared connection.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let db = self.db.lock().await;
        f(&db)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(BOOTSTRAP).map_err(map_sqlite_err)?;
            Ok(())
        })
        .await?;

        let backoff = Backoff {
            attempts: 20,
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: 0.25,
        };
        let mut attempt = 0;
        loop {
            if self
                .acquire_lock(SCHEMA_LOCK, &self.holder_id, Duration::from_secs(60))
                .await?
                .is_some()
            {
                break;
            }
            if attempt + 1 >= backoff.attempts {
                return Err(Error::transient("schema bootstrap is locked by another process"));
            }
            debug!("Schema lock held elsewhere, waiting (attempt {})", attempt + 1);
            tokio::time::sleep(backoff.delay(attempt)).await;
            attempt += 1;
        }

        let applied = self
            .with_tx(|conn| {
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT version FROM schema_migrations WHERE version = ?1",
                        params![SCHEMA_VERSION],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_sqlite_err)?;
                if existing.is_some() {
                    return Ok(false);
                }
                conn.execute_batch(SCHEMA).map_err(map_sqlite_err)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, encode_ts(&Utc::now())],
                )
                .map_err(map_sqlite_err)?;
                Ok(true)
            })
            .await;

        self.release_lock(SCHEMA_LOCK, &self.holder_id).await?;
        if applied? {
            info!("Applied embedded schema version {}", SCHEMA_VERSION);
        }
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(30))
        .map_err(map_sqlite_err)?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(map_sqlite_err)?;
    let _mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(map_sqlite_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(map_sqlite_err)?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .map_err(map_sqlite_err)?;
    conn.pragma_update(None, "cache_size", -16000i64)
        .map_err(map_sqlite_err)?;
    Ok(())
}

/// Driver errors never reach callers verbatim; the original stays attached
/// as the source for logs.
pub(crate) fn map_sqlite_err(err: rusqlite::Error) -> Error {
    let (kind, message) = match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                (ErrorKind::Transient, "embedded store is busy")
            }
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                (ErrorKind::Transient, "embedded store is unavailable")
            }
            ErrorCode::ConstraintViolation => (ErrorKind::Conflict, "record conflicts with existing data"),
            _ => (ErrorKind::Internal, "storage operation failed"),
        },
        rusqlite::Error::QueryReturnedNoRows => (ErrorKind::NotFound, "record not found"),
        _ => (ErrorKind::Internal, "storage operation failed"),
    };
    Error::new(kind, message).with_source(err)
}

pub(crate) trait SqlResultExt<T> {
    fn sql(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn sql(self) -> Result<T> {
        self.map_err(map_sqlite_err)
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Embedded
    }

    async fn health_check(&self) -> Result<()> {
        let check = self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .sql()
                .map(|_| ())
        });
        match tokio::time::timeout(Duration::from_secs(2), check).await {
            Ok(res) => res,
            Err(_) => Err(Error::transient("embedded store health check timed out")),
        }
    }

    async fn close(&self) {
        let db = self.db.lock().await;
        let _ = db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        info!("Embedded store closed");
    }
}
