use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::StoreError;

pub type Row = Vec<Value>;

/// The low-level contract every store (and the dual-write layer) exposes.
pub trait ConnPool: Send + Sync {
    /// # Errors
    /// Returns an error when the statement fails.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, StoreError>;

    /// # Errors
    /// Returns an error when the statement fails or a column cannot be read.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    /// # Errors
    /// Returns an error when the transaction cannot be started.
    fn begin(&self) -> Result<Box<dyn Tx + '_>, StoreError>;
}

/// A transaction handed out by [`ConnPool::begin`]. Dropping it without
/// committing rolls it back.
pub trait Tx {
    /// # Errors
    /// Returns an error when the statement fails.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, StoreError>;

    /// # Errors
    /// Returns an error when the statement fails or a column cannot be read.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    /// # Errors
    /// Returns an error when the commit fails.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the rollback fails.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub(crate) fn execute_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params_from_iter(params.iter()))?)
}

pub(crate) fn query_on(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let width = stmt.column_count();
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        (0..width).map(|idx| row.get::<_, Value>(idx)).collect::<rusqlite::Result<Row>>()
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// A single SQLite database behind one serialised connection.
pub struct SqlitePool {
    name: String,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").field("name", &self.name).finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Open a SQLite database file and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { name: name.into(), conn: Mutex::new(conn) })
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory(name: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { name: name.into(), conn: Mutex::new(conn) })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a batch of statements, typically schema bootstrap.
    ///
    /// # Errors
    /// Returns an error when any statement in the batch fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        Ok(self.conn.lock().execute_batch(sql)?)
    }
}

impl ConnPool for SqlitePool {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        execute_on(&self.conn.lock(), sql, params)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        query_on(&self.conn.lock(), sql, params)
    }

    fn begin(&self) -> Result<Box<dyn Tx + '_>, StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx { conn, finished: false }))
    }
}

/// Holds the connection lock for the lifetime of the transaction.
pub struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Tx for SqliteTx<'_> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        execute_on(&self.conn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        query_on(&self.conn, sql, params)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(err.into());
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        Ok(self.conn.execute_batch("ROLLBACK")?)
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
