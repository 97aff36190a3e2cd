use std::sync::Arc;

use migrator_core::Entity;
use migrator_store_sqlite::{ConnPool, Record, Row, RowReader, SqlitePool, StoreError, TableDao, Value};

pub(crate) const NOTES_SCHEMA: &str =
    "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, utime INTEGER NOT NULL);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Note {
    pub id: i64,
    pub body: String,
    pub utime: i64,
}

impl Entity for Note {
    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self.id == other.id && self.body == other.body
    }
}

impl Record for Note {
    const TABLE: &'static str = "notes";
    const COLUMNS: &'static [&'static str] = &["id", "body", "utime"];

    fn from_row(row: Row) -> Result<Self, StoreError> {
        let mut reader = RowReader::new(Self::TABLE, row);
        Ok(Self { id: reader.i64()?, body: reader.text()?, utime: reader.i64()? })
    }

    fn to_row(&self) -> Row {
        vec![Value::Integer(self.id), Value::Text(self.body.clone()), Value::Integer(self.utime)]
    }
}

pub(crate) fn note(id: i64, body: &str) -> Note {
    Note { id, body: body.to_string(), utime: id * 10 }
}

pub(crate) fn store(name: &str, rows: &[Note]) -> anyhow::Result<Arc<dyn ConnPool>> {
    let pool = SqlitePool::open_in_memory(name)?;
    pool.execute_batch(NOTES_SCHEMA)?;
    let pool: Arc<dyn ConnPool> = Arc::new(pool);
    let dao = TableDao::<Note>::new(pool.clone());
    for row in rows {
        dao.insert(row)?;
    }
    Ok(pool)
}

pub(crate) fn contents(pool: &Arc<dyn ConnPool>) -> anyhow::Result<Vec<(i64, String)>> {
    let dao = TableDao::<Note>::new(pool.clone());
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(row) = dao.find_nth_by_id(offset)? {
        out.push((row.id, row.body));
        offset += 1;
    }
    Ok(out)
}
