use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::db_schema::initialize_schema;

const FILE_POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum ConnectionTarget {
    File(PathBuf),
    SharedMemory(String),
}

/// r2d2 manager handing out configured rusqlite connections.
#[derive(Debug)]
pub struct SqliteConnectionManager {
    target: ConnectionTarget,
}

impl SqliteConnectionManager {
    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.target {
            ConnectionTarget::File(path) => Connection::open(path)?,
            ConnectionTarget::SharedMemory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if matches!(self.target, ConnectionTarget::File(_)) {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        Ok(conn)
    }
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        self.open()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let manager = SqliteConnectionManager {
            target: ConnectionTarget::File(path.to_path_buf()),
        };
        let pool = r2d2::Pool::builder()
            .max_size(FILE_POOL_SIZE)
            .build(manager)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self { pool };
        initialize_schema(&db)?;
        log::info!("[database] Opened {}", path.display());
        Ok(db)
    }

    /// Private in-memory database. A single pooled connection keeps the
    /// shared-cache database alive and avoids table-level lock contention.
    pub fn new_in_memory() -> Result<Self> {
        let uri = format!(
            "file:bridge-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let manager = SqliteConnectionManager {
            target: ConnectionTarget::SharedMemory(uri),
        };
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        initialize_schema(&db)?;
        Ok(db)
    }

    pub fn get_conn(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow!("Failed to get database connection: {e}"))
    }

    /// Runs `f` inside an immediate transaction; commits on `Ok`, rolls back on `Err`.
    /// The closure must not call back into `get_conn`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
