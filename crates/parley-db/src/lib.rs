pub mod migrations;
pub mod models;
pub mod queries;
pub mod store;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

pub use models::{CancelOutcome, DeliveryOutcome, SendRejection};
pub use store::ScheduleStore;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("send rejected: {0}")]
    Rejected(#[from] SendRejection),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and throwaway deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        f(&conn)
    }

    /// Like [`Database::with_conn`] but hands out the connection mutably so
    /// the closure can open a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        f(&mut conn)
    }
}
