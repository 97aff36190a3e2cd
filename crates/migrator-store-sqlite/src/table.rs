use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use migrator_core::Entity;
use rusqlite::types::Value;

use crate::pool::{ConnPool, Row};
use crate::StoreError;

/// Maps an [`Entity`] onto a table reachable through any [`ConnPool`].
pub trait Record: Entity {
    const TABLE: &'static str;
    /// Column order used by `from_row` and `to_row`. The first column is always `id`.
    const COLUMNS: &'static [&'static str];
    const UPDATE_TIME_COLUMN: &'static str = "utime";

    /// # Errors
    /// Returns an error when a column is missing or has the wrong type.
    fn from_row(row: Row) -> Result<Self, StoreError>;

    fn to_row(&self) -> Row;
}

/// Sequential, typed access to the columns of one row.
pub struct RowReader {
    table: &'static str,
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl RowReader {
    #[must_use]
    pub fn new(table: &'static str, row: Row) -> Self {
        Self { table, values: row.into_iter(), index: 0 }
    }

    fn next_value(&mut self) -> Result<Value, StoreError> {
        let index = self.index;
        self.index += 1;
        self.values.next().ok_or_else(|| StoreError::Decode {
            table: self.table,
            reason: format!("missing column {index}"),
        })
    }

    fn mismatch(&self, expected: &str, found: &Value) -> StoreError {
        StoreError::Decode {
            table: self.table,
            reason: format!("column {} expected {expected}, found {:?}", self.index - 1, found.data_type()),
        }
    }

    /// # Errors
    /// Returns an error when the next column is absent or not an integer.
    pub fn i64(&mut self) -> Result<i64, StoreError> {
        match self.next_value()? {
            Value::Integer(value) => Ok(value),
            other => Err(self.mismatch("integer", &other)),
        }
    }

    /// # Errors
    /// Returns an error when the next column is absent or not text.
    pub fn text(&mut self) -> Result<String, StoreError> {
        match self.next_value()? {
            Value::Text(value) => Ok(value),
            other => Err(self.mismatch("text", &other)),
        }
    }

    /// # Errors
    /// Returns an error when the next column is absent or neither text nor null.
    pub fn optional_text(&mut self) -> Result<Option<String>, StoreError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Text(value) => Ok(Some(value)),
            other => Err(self.mismatch("text or null", &other)),
        }
    }
}

/// Generic row access for one [`Record`] type over one store.
pub struct TableDao<T> {
    pool: Arc<dyn ConnPool>,
    select: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for TableDao<T> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), select: self.select.clone(), _record: PhantomData }
    }
}

impl<T: Record> TableDao<T> {
    #[must_use]
    pub fn new(pool: Arc<dyn ConnPool>) -> Self {
        let select = format!("SELECT {} FROM {}", T::COLUMNS.join(", "), T::TABLE);
        Self { pool, select, _record: PhantomData }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<dyn ConnPool> {
        &self.pool
    }

    fn first(&self, sql: &str, params: &[Value]) -> Result<Option<T>, StoreError> {
        self.pool.query(sql, params)?.into_iter().next().map(T::from_row).transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or the row cannot be decoded.
    pub fn find_by_id(&self, id: i64) -> Result<Option<T>, StoreError> {
        let sql = format!("{} WHERE id = ?1 LIMIT 1", self.select);
        self.first(&sql, &[Value::Integer(id)])
    }

    /// The row at position `offset` when ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or the row cannot be decoded.
    pub fn find_nth_by_id(&self, offset: i64) -> Result<Option<T>, StoreError> {
        let sql = format!("{} ORDER BY id LIMIT 1 OFFSET ?1", self.select);
        self.first(&sql, &[Value::Integer(offset)])
    }

    /// The row at position `offset` among rows updated at or after `utime`,
    /// ordered by update time and then id.
    ///
    /// # Errors
    /// Returns an error when the query fails or the row cannot be decoded.
    pub fn find_nth_updated_since(&self, utime: i64, offset: i64) -> Result<Option<T>, StoreError> {
        let column = T::UPDATE_TIME_COLUMN;
        let sql = format!(
            "{} WHERE {column} >= ?1 ORDER BY {column}, id LIMIT 1 OFFSET ?2",
            self.select
        );
        self.first(&sql, &[Value::Integer(utime), Value::Integer(offset)])
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn ids_page(&self, offset: i64, limit: i64) -> Result<Vec<i64>, StoreError> {
        let sql = format!("SELECT id FROM {} ORDER BY id LIMIT ?1 OFFSET ?2", T::TABLE);
        let rows = self.pool.query(&sql, &[Value::Integer(limit), Value::Integer(offset)])?;
        rows.into_iter().map(|row| RowReader::new(T::TABLE, row).i64()).collect()
    }

    /// The subset of `ids` present in this table.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn ids_in(&self, ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders =
            (1..=ids.len()).map(|idx| format!("?{idx}")).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT id FROM {} WHERE id IN ({placeholders})", T::TABLE);
        let params = ids.iter().copied().map(Value::Integer).collect::<Vec<_>>();
        let rows = self.pool.query(&sql, &params)?;
        rows.into_iter().map(|row| RowReader::new(T::TABLE, row).i64()).collect()
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert(&self, entity: &T) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::TABLE,
            T::COLUMNS.join(", "),
            placeholders(T::COLUMNS.len())
        );
        self.pool.execute(&sql, &entity.to_row())?;
        Ok(())
    }

    /// Insert `entity`, or overwrite `columns` of the existing row with the same id.
    ///
    /// # Errors
    /// Returns an error when a column is not part of the record or the statement fails.
    pub fn upsert(&self, entity: &T, columns: &[String]) -> Result<(), StoreError> {
        if let Some(unknown) = columns.iter().find(|column| !T::COLUMNS.contains(&column.as_str())) {
            return Err(StoreError::UnknownColumn { table: T::TABLE, column: unknown.clone() });
        }
        let conflict = if columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = columns
                .iter()
                .map(|column| format!("{column} = excluded.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {assignments}")
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) {conflict}",
            T::TABLE,
            T::COLUMNS.join(", "),
            placeholders(T::COLUMNS.len())
        );
        self.pool.execute(&sql, &entity.to_row())?;
        Ok(())
    }

    /// Deleting an id that is not present succeeds and reports zero rows.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_by_id(&self, id: i64) -> Result<usize, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE);
        self.pool.execute(&sql, &[Value::Integer(id)])
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn count(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        match self.pool.query(&sql, &[])?.into_iter().next() {
            Some(row) => RowReader::new(T::TABLE, row).i64(),
            None => Ok(0),
        }
    }
}

fn placeholders(count: usize) -> String {
    (1..=count).map(|idx| format!("?{idx}")).collect::<Vec<_>>().join(", ")
}

/// Ids in `target` that have no counterpart in `base`, in `target` order.
#[must_use]
pub fn missing_ids(target: &[i64], base: &[i64]) -> Vec<i64> {
    let present = base.iter().copied().collect::<HashSet<_>>();
    target.iter().copied().filter(|id| !present.contains(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqlitePool;
    use anyhow::Result;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Doc {
        id: i64,
        title: String,
        utime: i64,
    }

    impl Entity for Doc {
        fn id(&self) -> i64 {
            self.id
        }

        fn compare_to(&self, other: &Self) -> bool {
            self.id == other.id && self.title == other.title
        }
    }

    impl Record for Doc {
        const TABLE: &'static str = "docs";
        const COLUMNS: &'static [&'static str] = &["id", "title", "utime"];

        fn from_row(row: Row) -> Result<Self, StoreError> {
            let mut reader = RowReader::new(Self::TABLE, row);
            Ok(Self { id: reader.i64()?, title: reader.text()?, utime: reader.i64()? })
        }

        fn to_row(&self) -> Row {
            vec![Value::Integer(self.id), Value::Text(self.title.clone()), Value::Integer(self.utime)]
        }
    }

    fn doc(id: i64, title: &str, utime: i64) -> Doc {
        Doc { id, title: title.to_string(), utime }
    }

    fn dao() -> Result<TableDao<Doc>> {
        let pool = SqlitePool::open_in_memory("docs")?;
        pool.execute_batch(
            "CREATE TABLE docs (id INTEGER PRIMARY KEY, title TEXT NOT NULL, utime INTEGER NOT NULL);",
        )?;
        Ok(TableDao::new(Arc::new(pool)))
    }

    // Test IDs: TTBL-001
    #[test]
    fn scans_by_id_and_by_update_time() -> Result<()> {
        let dao = dao()?;
        dao.insert(&doc(3, "c", 10))?;
        dao.insert(&doc(1, "a", 30))?;
        dao.insert(&doc(2, "b", 20))?;

        assert_eq!(dao.find_nth_by_id(0)?, Some(doc(1, "a", 30)));
        assert_eq!(dao.find_nth_by_id(2)?, Some(doc(3, "c", 10)));
        assert_eq!(dao.find_nth_by_id(3)?, None);

        assert_eq!(dao.find_nth_updated_since(20, 0)?, Some(doc(2, "b", 20)));
        assert_eq!(dao.find_nth_updated_since(20, 1)?, Some(doc(1, "a", 30)));
        assert_eq!(dao.find_nth_updated_since(20, 2)?, None);

        assert_eq!(dao.ids_page(1, 10)?, vec![2, 3]);
        let mut present = dao.ids_in(&[3, 4, 1])?;
        present.sort_unstable();
        assert_eq!(present, vec![1, 3]);
        assert!(dao.ids_in(&[])?.is_empty());
        Ok(())
    }

    // Test IDs: TTBL-002
    #[test]
    fn upsert_overwrites_only_listed_columns() -> Result<()> {
        let dao = dao()?;
        dao.insert(&doc(1, "old", 5))?;
        dao.upsert(&doc(1, "new", 9), &["title".to_string()])?;
        assert_eq!(dao.find_by_id(1)?, Some(doc(1, "new", 5)));

        dao.upsert(&doc(2, "fresh", 7), &["title".to_string()])?;
        assert_eq!(dao.find_by_id(2)?, Some(doc(2, "fresh", 7)));

        let err = dao.upsert(&doc(1, "x", 1), &["nope".to_string()]);
        assert!(matches!(err, Err(StoreError::UnknownColumn { .. })));
        Ok(())
    }

    // Test IDs: TTBL-003
    #[test]
    fn delete_of_absent_row_succeeds() -> Result<()> {
        let dao = dao()?;
        dao.insert(&doc(1, "a", 1))?;
        assert_eq!(dao.delete_by_id(1)?, 1);
        assert_eq!(dao.delete_by_id(1)?, 0);
        assert_eq!(dao.count()?, 0);
        Ok(())
    }

    // Test IDs: TTBL-004
    #[test]
    fn decode_reports_type_mismatch() {
        let row = vec![Value::Text("1".to_string()), Value::Text("a".to_string())];
        match Doc::from_row(row) {
            Err(StoreError::Decode { table, .. }) => assert_eq!(table, "docs"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    proptest! {
        // Test IDs: TTBL-005
        #[test]
        fn missing_ids_is_exactly_the_set_difference(
            target in proptest::collection::vec(0_i64..64, 0..40),
            base in proptest::collection::vec(0_i64..64, 0..40),
        ) {
            let missing = missing_ids(&target, &base);
            for id in &missing {
                prop_assert!(target.contains(id));
                prop_assert!(!base.contains(id));
            }
            for id in &target {
                prop_assert_eq!(missing.contains(id), !base.contains(id));
            }
        }
    }
}
