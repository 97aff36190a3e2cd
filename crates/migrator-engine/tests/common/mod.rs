//! Shared fixtures for migration flow tests.

use std::path::PathBuf;
use std::sync::Arc;

use migrator_core::Entity;
use migrator_store_sqlite::{ConnPool, Record, Row, RowReader, SqlitePool, StoreError, TableDao, Value};

pub const ACCOUNTS_SCHEMA: &str = "CREATE TABLE accounts (
  id INTEGER PRIMARY KEY,
  owner TEXT NOT NULL,
  balance INTEGER NOT NULL,
  utime INTEGER NOT NULL
);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub utime: i64,
}

impl Entity for Account {
    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self.id == other.id && self.owner == other.owner && self.balance == other.balance
    }
}

impl Record for Account {
    const TABLE: &'static str = "accounts";
    const COLUMNS: &'static [&'static str] = &["id", "owner", "balance", "utime"];

    fn from_row(row: Row) -> Result<Self, StoreError> {
        let mut reader = RowReader::new(Self::TABLE, row);
        Ok(Self {
            id: reader.i64()?,
            owner: reader.text()?,
            balance: reader.i64()?,
            utime: reader.i64()?,
        })
    }

    fn to_row(&self) -> Row {
        vec![
            Value::Integer(self.id),
            Value::Text(self.owner.clone()),
            Value::Integer(self.balance),
            Value::Integer(self.utime),
        ]
    }
}

#[allow(dead_code)]
pub fn account(id: i64, owner: &str) -> Account {
    Account { id, owner: owner.to_string(), balance: 0, utime: id }
}

#[allow(dead_code)]
pub fn unique_temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("migrator-{label}-{}.sqlite3", ulid::Ulid::new()))
}

pub fn seeded_store(name: &str, rows: &[Account]) -> anyhow::Result<Arc<dyn ConnPool>> {
    let pool = SqlitePool::open_in_memory(name)?;
    pool.execute_batch(ACCOUNTS_SCHEMA)?;
    let pool: Arc<dyn ConnPool> = Arc::new(pool);
    let dao = TableDao::<Account>::new(pool.clone());
    for row in rows {
        dao.insert(row)?;
    }
    Ok(pool)
}

/// `(id, owner)` pairs ordered by id.
pub fn owners(pool: &Arc<dyn ConnPool>) -> anyhow::Result<Vec<(i64, String)>> {
    let dao = TableDao::<Account>::new(pool.clone());
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(row) = dao.find_nth_by_id(offset)? {
        out.push((row.id, row.owner));
        offset += 1;
    }
    Ok(out)
}
