//! The `interactives` counters table: the entity this service migrates.

use std::sync::Arc;

use migrator_core::Entity;
use migrator_store_sqlite::{ConnPool, Record, Row, RowReader, SqlitePool, StoreError, TableDao, Value};
use serde::Serialize;
use time::OffsetDateTime;

pub const INTERACTIVES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS interactives (
  id INTEGER PRIMARY KEY,
  biz TEXT NOT NULL,
  biz_id INTEGER NOT NULL,
  read_cnt INTEGER NOT NULL DEFAULT 0,
  like_cnt INTEGER NOT NULL DEFAULT 0,
  collect_cnt INTEGER NOT NULL DEFAULT 0,
  ctime INTEGER NOT NULL,
  utime INTEGER NOT NULL,
  UNIQUE (biz, biz_id)
);
CREATE INDEX IF NOT EXISTS idx_interactives_utime ON interactives(utime);
";

const SELECT_ID_BY_KEY_SQL: &str = "SELECT id FROM interactives WHERE biz = ?1 AND biz_id = ?2";
const NEXT_ID_SQL: &str = "SELECT COALESCE(MAX(id), 0) + 1 FROM interactives";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interactive {
    pub id: i64,
    pub biz: String,
    pub biz_id: i64,
    pub read_cnt: i64,
    pub like_cnt: i64,
    pub collect_cnt: i64,
    /// Unix milliseconds.
    pub ctime: i64,
    /// Unix milliseconds.
    pub utime: i64,
}

impl Entity for Interactive {
    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self == other
    }
}

impl Record for Interactive {
    const TABLE: &'static str = "interactives";
    const COLUMNS: &'static [&'static str] =
        &["id", "biz", "biz_id", "read_cnt", "like_cnt", "collect_cnt", "ctime", "utime"];

    fn from_row(row: Row) -> Result<Self, StoreError> {
        let mut reader = RowReader::new(Self::TABLE, row);
        Ok(Self {
            id: reader.i64()?,
            biz: reader.text()?,
            biz_id: reader.i64()?,
            read_cnt: reader.i64()?,
            like_cnt: reader.i64()?,
            collect_cnt: reader.i64()?,
            ctime: reader.i64()?,
            utime: reader.i64()?,
        })
    }

    fn to_row(&self) -> Row {
        vec![
            Value::Integer(self.id),
            Value::Text(self.biz.clone()),
            Value::Integer(self.biz_id),
            Value::Integer(self.read_cnt),
            Value::Integer(self.like_cnt),
            Value::Integer(self.collect_cnt),
            Value::Integer(self.ctime),
            Value::Integer(self.utime),
        ]
    }
}

/// Create the table on a raw store if it does not exist yet.
///
/// # Errors
/// Returns an error when the DDL fails.
pub fn bootstrap(pool: &SqlitePool) -> Result<(), StoreError> {
    pool.execute_batch(INTERACTIVES_SCHEMA)
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Read,
    Like,
}

impl Counter {
    fn column(self) -> &'static str {
        match self {
            Self::Read => "read_cnt",
            Self::Like => "like_cnt",
        }
    }
}

/// Application-side access to `interactives`. Handed the dual-write pool, every
/// write goes through whatever the current pattern dictates.
#[derive(Clone)]
pub struct InteractiveDao {
    pool: Arc<dyn ConnPool>,
}

impl InteractiveDao {
    #[must_use]
    pub fn new(pool: Arc<dyn ConnPool>) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error when the primary store rejects the write.
    pub fn incr_read_cnt(&self, biz: &str, biz_id: i64) -> Result<Interactive, StoreError> {
        self.bump(Counter::Read, biz, biz_id, now_millis())
    }

    /// # Errors
    /// Returns an error when the primary store rejects the write.
    pub fn like(&self, biz: &str, biz_id: i64) -> Result<Interactive, StoreError> {
        self.bump(Counter::Like, biz, biz_id, now_millis())
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn get(&self, biz: &str, biz_id: i64) -> Result<Option<Interactive>, StoreError> {
        let rows = self.pool.query(SELECT_ID_BY_KEY_SQL, &key(biz, biz_id))?;
        match rows.into_iter().next() {
            None => Ok(None),
            Some(row) => {
                let id = RowReader::new(Interactive::TABLE, row).i64()?;
                TableDao::<Interactive>::new(self.pool.clone()).find_by_id(id)
            }
        }
    }

    /// Increments one counter, creating the row on first touch.
    ///
    /// New ids are allocated inside the transaction from the primary store and
    /// written explicitly, so the mirrored insert lands on the same id.
    fn bump(&self, counter: Counter, biz: &str, biz_id: i64, now: i64) -> Result<Interactive, StoreError> {
        let column = counter.column();
        let mut tx = self.pool.begin()?;
        let existing = tx.query(SELECT_ID_BY_KEY_SQL, &key(biz, biz_id))?.into_iter().next();
        let id = match existing {
            Some(row) => {
                let id = RowReader::new(Interactive::TABLE, row).i64()?;
                tx.execute(
                    &format!("UPDATE interactives SET {column} = {column} + 1, utime = ?1 WHERE id = ?2"),
                    &[Value::Integer(now), Value::Integer(id)],
                )?;
                id
            }
            None => {
                let id = match tx.query(NEXT_ID_SQL, &[])?.into_iter().next() {
                    Some(row) => RowReader::new(Interactive::TABLE, row).i64()?,
                    None => 1,
                };
                let mut row = Interactive {
                    id,
                    biz: biz.to_string(),
                    biz_id,
                    read_cnt: 0,
                    like_cnt: 0,
                    collect_cnt: 0,
                    ctime: now,
                    utime: now,
                };
                match counter {
                    Counter::Read => row.read_cnt = 1,
                    Counter::Like => row.like_cnt = 1,
                }
                tx.execute(
                    "INSERT INTO interactives (id, biz, biz_id, read_cnt, like_cnt, collect_cnt, ctime, utime)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    &row.to_row(),
                )?;
                id
            }
        };
        let rows = tx.query(
            &format!("SELECT {} FROM interactives WHERE id = ?1", Interactive::COLUMNS.join(", ")),
            &[Value::Integer(id)],
        )?;
        tx.commit()?;
        match rows.into_iter().next() {
            Some(row) => Interactive::from_row(row),
            None => Err(StoreError::Decode {
                table: Interactive::TABLE,
                reason: format!("row {id} vanished inside its own transaction"),
            }),
        }
    }
}

fn key(biz: &str, biz_id: i64) -> [Value; 2] {
    [Value::Text(biz.to_string()), Value::Integer(biz_id)]
}

fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
