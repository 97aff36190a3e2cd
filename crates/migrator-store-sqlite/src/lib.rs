//! SQLite-backed storage for online table migrations.
//!
//! Everything above this crate talks to storage through [`ConnPool`]. A plain
//! [`SqlitePool`] is one store; a [`DualWritePool`] looks exactly like one store
//! while fanning statements out to a source and a destination according to the
//! live [`migrator_core::Pattern`].

use std::time::Duration;

use migrator_core::{BrokerError, PatternError};

mod dual;
mod event_log;
mod pool;
mod table;

pub use dual::DualWritePool;
pub use event_log::SqliteEventLog;
pub use pool::{ConnPool, Row, SqlitePool, SqliteTx, Tx};
pub use rusqlite::types::Value;
pub use table::{missing_ids, Record, RowReader, TableDao};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to decode {table} row: {reason}")]
    Decode { table: &'static str, reason: String },
    #[error("unknown column {column} for table {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store worker failed: {0}")]
    Worker(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
