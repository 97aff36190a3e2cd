use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use migrator_core::Pattern;
use rusqlite::types::Value;

use crate::pool::{ConnPool, Row, Tx};
use crate::StoreError;

/// A [`ConnPool`] that routes every statement to a source and/or destination
/// store according to the live pattern.
///
/// The pattern is loaded once at the start of every operation, so a statement
/// or transaction never observes two patterns. In the `*First` patterns the
/// authoritative store decides the outcome; the follower is best-effort and
/// its failures are logged and left for validation to catch.
pub struct DualWritePool {
    src: Arc<dyn ConnPool>,
    dst: Arc<dyn ConnPool>,
    pattern: AtomicU8,
}

struct Route<'a> {
    pattern: Pattern,
    primary: &'a dyn ConnPool,
    follower: Option<&'a dyn ConnPool>,
}

impl DualWritePool {
    #[must_use]
    pub fn new(src: Arc<dyn ConnPool>, dst: Arc<dyn ConnPool>) -> Self {
        Self { src, dst, pattern: AtomicU8::new(Pattern::SrcOnly.to_u8()) }
    }

    pub fn update_pattern(&self, pattern: Pattern) {
        self.pattern.store(pattern.to_u8(), Ordering::Release);
        tracing::info!(pattern = %pattern, "dual-write pattern updated");
    }

    /// # Errors
    /// Returns an error when the stored pattern code is not a known pattern.
    pub fn pattern(&self) -> Result<Pattern, StoreError> {
        Ok(Pattern::from_u8(self.pattern.load(Ordering::Acquire))?)
    }

    fn route(&self) -> Result<Route<'_>, StoreError> {
        let pattern = self.pattern()?;
        let (primary, follower): (&dyn ConnPool, Option<&dyn ConnPool>) = match pattern {
            Pattern::SrcOnly => (self.src.as_ref(), None),
            Pattern::SrcFirst => (self.src.as_ref(), Some(self.dst.as_ref())),
            Pattern::DstFirst => (self.dst.as_ref(), Some(self.src.as_ref())),
            Pattern::DstOnly => (self.dst.as_ref(), None),
        };
        Ok(Route { pattern, primary, follower })
    }
}

impl ConnPool for DualWritePool {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        let route = self.route()?;
        let affected = route.primary.execute(sql, params)?;
        if let Some(follower) = route.follower {
            if let Err(err) = follower.execute(sql, params) {
                tracing::warn!(
                    pattern = %route.pattern,
                    sql,
                    error = %err,
                    "dual write to follower store failed"
                );
            }
        }
        Ok(affected)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        self.route()?.primary.query(sql, params)
    }

    /// Store transactions hold their connection until commit, so both stores
    /// are always begun src before dst. Primary and follower are roles only.
    fn begin(&self) -> Result<Box<dyn Tx + '_>, StoreError> {
        let pattern = self.pattern()?;
        let (primary, follower) = match pattern {
            Pattern::SrcOnly => (self.src.begin()?, None),
            Pattern::DstOnly => (self.dst.begin()?, None),
            Pattern::SrcFirst => {
                let primary = self.src.begin()?;
                (primary, follower_tx(pattern, self.dst.begin()))
            }
            Pattern::DstFirst => {
                let follower = follower_tx(pattern, self.src.begin());
                (self.dst.begin()?, follower)
            }
        };
        Ok(Box::new(DualTx { pattern, primary, follower }))
    }
}

fn follower_tx<'a>(
    pattern: Pattern,
    begun: Result<Box<dyn Tx + 'a>, StoreError>,
) -> Option<Box<dyn Tx + 'a>> {
    match begun {
        Ok(tx) => Some(tx),
        Err(err) => {
            tracing::warn!(
                pattern = %pattern,
                error = %err,
                "failed to begin follower transaction; continuing on primary only"
            );
            None
        }
    }
}

/// Transaction opened under one captured pattern. The follower transaction is
/// dropped (and rolled back) the first time it fails.
struct DualTx<'a> {
    pattern: Pattern,
    primary: Box<dyn Tx + 'a>,
    follower: Option<Box<dyn Tx + 'a>>,
}

impl DualTx<'_> {
    fn abandon_follower(&mut self) {
        if let Some(follower) = self.follower.take() {
            if let Err(err) = follower.rollback() {
                tracing::warn!(pattern = %self.pattern, error = %err, "follower rollback failed");
            }
        }
    }
}

impl Tx for DualTx<'_> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
        let affected = self.primary.execute(sql, params)?;
        let mirrored = match self.follower.as_mut() {
            Some(follower) => follower.execute(sql, params).map(|_| ()),
            None => Ok(()),
        };
        if let Err(err) = mirrored {
            tracing::warn!(
                pattern = %self.pattern,
                sql,
                error = %err,
                "dual write to follower transaction failed; abandoning follower"
            );
            self.abandon_follower();
        }
        Ok(affected)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        self.primary.query(sql, params)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { pattern, primary, follower } = *self;
        primary.commit()?;
        if let Some(follower) = follower {
            if let Err(err) = follower.commit() {
                tracing::warn!(pattern = %pattern, error = %err, "follower commit failed");
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { pattern, primary, follower } = *self;
        if let Some(follower) = follower {
            if let Err(err) = follower.rollback() {
                tracing::warn!(pattern = %pattern, error = %err, "follower rollback failed");
            }
        }
        primary.rollback()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::SqlitePool;
    use anyhow::Result;

    const SCHEMA: &str = "CREATE TABLE kv (id INTEGER PRIMARY KEY, v TEXT NOT NULL);";

    /// Wraps a real store and fails every statement while `broken` is set.
    struct FlakyPool {
        inner: SqlitePool,
        broken: AtomicBool,
    }

    impl FlakyPool {
        fn new(name: &str) -> Result<Self> {
            let inner = SqlitePool::open_in_memory(name)?;
            inner.execute_batch(SCHEMA)?;
            Ok(Self { inner, broken: AtomicBool::new(false) })
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(format!("{} is down", self.inner.name())));
            }
            Ok(())
        }
    }

    impl ConnPool for FlakyPool {
        fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.execute(sql, params)
        }

        fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
            self.check()?;
            self.inner.query(sql, params)
        }

        fn begin(&self) -> Result<Box<dyn Tx + '_>, StoreError> {
            self.check()?;
            self.inner.begin()
        }
    }

    fn fixture() -> Result<(Arc<FlakyPool>, Arc<FlakyPool>, DualWritePool)> {
        let src = Arc::new(FlakyPool::new("src")?);
        let dst = Arc::new(FlakyPool::new("dst")?);
        let pool = DualWritePool::new(src.clone(), dst.clone());
        Ok((src, dst, pool))
    }

    fn insert(pool: &dyn ConnPool, id: i64, v: &str) -> Result<usize, StoreError> {
        pool.execute(
            "INSERT INTO kv (id, v) VALUES (?1, ?2)",
            &[Value::Integer(id), Value::Text(v.to_string())],
        )
    }

    fn ids(pool: &FlakyPool) -> Result<Vec<Row>, StoreError> {
        pool.inner.query("SELECT id FROM kv ORDER BY id", &[])
    }

    // Test IDs: TDW-001
    #[test]
    fn src_only_touches_source_alone() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        assert_eq!(pool.pattern()?, Pattern::SrcOnly);
        insert(&pool, 1, "a")?;
        assert_eq!(ids(&src)?.len(), 1);
        assert!(ids(&dst)?.is_empty());
        Ok(())
    }

    // Test IDs: TDW-002
    #[test]
    fn src_first_mirrors_and_tolerates_destination_failure() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        pool.update_pattern(Pattern::SrcFirst);
        insert(&pool, 1, "a")?;
        assert_eq!(ids(&dst)?.len(), 1);

        dst.broken.store(true, Ordering::SeqCst);
        assert_eq!(insert(&pool, 2, "b")?, 1);
        dst.broken.store(false, Ordering::SeqCst);

        assert_eq!(ids(&src)?, vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]);
        assert_eq!(ids(&dst)?, vec![vec![Value::Integer(1)]]);
        Ok(())
    }

    // Test IDs: TDW-003
    #[test]
    fn primary_failure_is_fatal_and_skips_follower() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        pool.update_pattern(Pattern::DstFirst);
        dst.broken.store(true, Ordering::SeqCst);
        assert!(insert(&pool, 1, "a").is_err());
        dst.broken.store(false, Ordering::SeqCst);
        assert!(ids(&src)?.is_empty());
        assert!(ids(&dst)?.is_empty());
        Ok(())
    }

    // Test IDs: TDW-004
    #[test]
    fn reads_follow_the_pattern() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        insert(src.as_ref(), 1, "from-src")?;
        insert(dst.as_ref(), 1, "from-dst")?;
        let read = |pool: &DualWritePool| pool.query("SELECT v FROM kv WHERE id = 1", &[]);

        for (pattern, expected) in [
            (Pattern::SrcOnly, "from-src"),
            (Pattern::SrcFirst, "from-src"),
            (Pattern::DstFirst, "from-dst"),
            (Pattern::DstOnly, "from-dst"),
        ] {
            pool.update_pattern(pattern);
            assert_eq!(read(&pool)?, vec![vec![Value::Text(expected.to_string())]]);
        }
        Ok(())
    }

    // Test IDs: TDW-005
    #[test]
    fn transaction_keeps_the_pattern_it_started_with() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        pool.update_pattern(Pattern::SrcFirst);
        let mut tx = pool.begin()?;
        tx.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", &[])?;
        pool.update_pattern(Pattern::DstOnly);
        tx.execute("INSERT INTO kv (id, v) VALUES (2, 'b')", &[])?;
        tx.commit()?;

        assert_eq!(ids(&src)?.len(), 2);
        assert_eq!(ids(&dst)?.len(), 2);
        Ok(())
    }

    // Test IDs: TDW-006
    #[test]
    fn follower_statement_failure_abandons_only_the_follower() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        insert(dst.as_ref(), 2, "already-there")?;
        pool.update_pattern(Pattern::SrcFirst);

        let mut tx = pool.begin()?;
        tx.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", &[])?;
        // Conflicts on the destination only.
        tx.execute("INSERT INTO kv (id, v) VALUES (2, 'b')", &[])?;
        tx.execute("INSERT INTO kv (id, v) VALUES (3, 'c')", &[])?;
        tx.commit()?;

        assert_eq!(ids(&src)?.len(), 3);
        assert_eq!(ids(&dst)?, vec![vec![Value::Integer(2)]]);
        Ok(())
    }

    // Test IDs: TDW-007
    #[test]
    fn rolled_back_transaction_leaves_both_stores_untouched() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        pool.update_pattern(Pattern::DstFirst);
        let mut tx = pool.begin()?;
        tx.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", &[])?;
        tx.rollback()?;
        assert!(ids(&src)?.is_empty());
        assert!(ids(&dst)?.is_empty());
        Ok(())
    }

    // Test IDs: TDW-008
    #[test]
    fn pattern_flips_during_concurrent_transactions_do_not_wedge_writers() -> Result<()> {
        let (src, dst, pool) = fixture()?;
        let pool = Arc::new(pool);
        pool.update_pattern(Pattern::SrcFirst);

        let (done_tx, done_rx) = mpsc::channel();
        for (worker, flips) in [(0_i64, true), (1_i64, false)] {
            let pool = pool.clone();
            let done = done_tx.clone();
            std::thread::spawn(move || {
                let outcome = (0..200_i64).try_for_each(|n| -> Result<(), StoreError> {
                    if flips {
                        pool.update_pattern(if n % 2 == 0 { Pattern::DstFirst } else { Pattern::SrcFirst });
                    }
                    let mut tx = pool.begin()?;
                    tx.execute(
                        "INSERT INTO kv (id, v) VALUES (?1, 'x')",
                        &[Value::Integer(worker * 1_000 + n)],
                    )?;
                    tx.commit()
                });
                let _ = done.send(outcome);
            });
        }
        drop(done_tx);

        for _ in 0..2 {
            done_rx.recv_timeout(Duration::from_secs(30))??;
        }
        // Both dual-write patterns reach both stores, so every transaction saw one pattern.
        let written = ids(&src)?;
        assert_eq!(written.len(), 400);
        assert_eq!(written, ids(&dst)?);
        Ok(())
    }
}
