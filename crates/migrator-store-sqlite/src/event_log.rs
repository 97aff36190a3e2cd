use std::path::Path;

use migrator_core::{BrokerError, Delivery, EventEnvelope, EventProducer, EventSource, InconsistentEvent};
use rusqlite::types::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::pool::{ConnPool, SqlitePool};
use crate::table::RowReader;
use crate::StoreError;

const CREATE_EVENT_LOG_SQL: &str = r"
CREATE TABLE IF NOT EXISTS inconsistent_events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  topic TEXT NOT NULL,
  schema_version TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  in_flight INTEGER NOT NULL DEFAULT 0 CHECK (in_flight IN (0, 1)),
  last_error TEXT,
  published_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inconsistent_events_pending
  ON inconsistent_events(topic, in_flight, seq);
";

const EVENT_LOG_TABLE: &str = "inconsistent_events";

/// Durable, at-least-once event log for one topic.
///
/// Events stay in the table until acked, and acking deletes them. Deliveries
/// left in flight by a consumer that went away are released again when the
/// log is reopened.
#[derive(Debug)]
pub struct SqliteEventLog {
    topic: String,
    pool: SqlitePool,
}

fn unavailable(err: StoreError) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

fn now_rfc3339() -> Result<String, BrokerError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| BrokerError::Unavailable(err.to_string()))
}

impl SqliteEventLog {
    /// # Errors
    /// Returns an error when the database cannot be opened or bootstrapped.
    pub fn open(path: &Path, topic: impl Into<String>) -> Result<Self, StoreError> {
        Self::bootstrap(SqlitePool::open("events", path)?, topic.into())
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be bootstrapped.
    pub fn open_in_memory(topic: impl Into<String>) -> Result<Self, StoreError> {
        Self::bootstrap(SqlitePool::open_in_memory("events")?, topic.into())
    }

    fn bootstrap(pool: SqlitePool, topic: String) -> Result<Self, StoreError> {
        pool.execute_batch(CREATE_EVENT_LOG_SQL)?;
        let released = pool.execute(
            "UPDATE inconsistent_events SET in_flight = 0 WHERE topic = ?1 AND in_flight = 1",
            &[Value::Text(topic.clone())],
        )?;
        if released > 0 {
            tracing::info!(topic = %topic, released, "released in-flight deliveries from a previous consumer");
        }
        Ok(Self { topic, pool })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Events not yet acked, whether or not they are currently in flight.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn pending(&self) -> Result<i64, StoreError> {
        let rows = self.pool.query(
            "SELECT COUNT(*) FROM inconsistent_events WHERE topic = ?1",
            &[Value::Text(self.topic.clone())],
        )?;
        match rows.into_iter().next() {
            Some(row) => RowReader::new(EVENT_LOG_TABLE, row).i64(),
            None => Ok(0),
        }
    }

    /// Last recorded failure for a delivery, if any.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn last_error(&self, delivery_id: i64) -> Result<Option<String>, StoreError> {
        let rows = self.pool.query(
            "SELECT last_error FROM inconsistent_events WHERE seq = ?1",
            &[Value::Integer(delivery_id)],
        )?;
        match rows.into_iter().next() {
            Some(row) => RowReader::new(EVENT_LOG_TABLE, row).optional_text(),
            None => Ok(None),
        }
    }

    fn settle(&self, sql: &str, params: &[Value], delivery_id: i64) -> Result<(), BrokerError> {
        let updated = self.pool.execute(sql, params).map_err(unavailable)?;
        if updated == 0 {
            return Err(BrokerError::UnknownDelivery(delivery_id));
        }
        Ok(())
    }
}

impl EventProducer for SqliteEventLog {
    fn produce(&self, event: &InconsistentEvent) -> Result<(), BrokerError> {
        let envelope = EventEnvelope::new(self.topic.clone(), *event);
        let payload = envelope.to_json()?;
        self.pool
            .execute(
                "INSERT INTO inconsistent_events(topic, schema_version, payload_json, published_at)
                 VALUES (?1, ?2, ?3, ?4)",
                &[
                    Value::Text(envelope.topic),
                    Value::Text(envelope.schema_version),
                    Value::Text(payload),
                    Value::Text(now_rfc3339()?),
                ],
            )
            .map_err(unavailable)?;
        Ok(())
    }
}

impl EventSource for SqliteEventLog {
    fn poll(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().map_err(unavailable)?;
        let rows = tx
            .query(
                "SELECT seq, attempts, payload_json FROM inconsistent_events
                 WHERE topic = ?1 AND in_flight = 0
                 ORDER BY seq LIMIT ?2",
                &[Value::Text(self.topic.clone()), Value::Integer(limit)],
            )
            .map_err(unavailable)?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let mut reader = RowReader::new(EVENT_LOG_TABLE, row);
            let delivery_id = reader.i64().map_err(unavailable)?;
            let attempts = reader.i64().map_err(unavailable)?;
            let payload = reader.text().map_err(unavailable)?;
            tx.execute(
                "UPDATE inconsistent_events SET in_flight = 1, attempts = attempts + 1 WHERE seq = ?1",
                &[Value::Integer(delivery_id)],
            )
            .map_err(unavailable)?;
            deliveries.push(Delivery {
                delivery_id,
                attempts: u32::try_from(attempts + 1).unwrap_or(u32::MAX),
                payload,
            });
        }
        tx.commit().map_err(unavailable)?;
        Ok(deliveries)
    }

    fn ack(&self, delivery_id: i64) -> Result<(), BrokerError> {
        self.settle(
            "DELETE FROM inconsistent_events WHERE seq = ?1 AND in_flight = 1",
            &[Value::Integer(delivery_id)],
            delivery_id,
        )
    }

    fn nack(&self, delivery_id: i64, reason: &str) -> Result<(), BrokerError> {
        self.settle(
            "UPDATE inconsistent_events SET in_flight = 0, last_error = ?1
             WHERE seq = ?2 AND in_flight = 1",
            &[Value::Text(reason.to_string()), Value::Integer(delivery_id)],
            delivery_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use crate::Row;
    use migrator_core::{Direction, InconsistentEventType};

    fn unique_temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("migrator-events-{}.sqlite3", ulid::Ulid::new()))
    }

    // Test IDs: TLOG-001
    #[test]
    fn produce_poll_ack_and_nack_cycle() -> Result<()> {
        let log = SqliteEventLog::open_in_memory("inconsistent_interactive")?;
        log.produce(&InconsistentEvent::new(7, InconsistentEventType::NotEqual, Direction::Src))?;
        log.produce(&InconsistentEvent::new(8, InconsistentEventType::BaseMissing, Direction::Dst))?;

        let first = log.poll(10)?;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].event()?.id, 7);
        assert_eq!(first[1].event()?.direction, Direction::Dst);
        assert!(log.poll(10)?.is_empty());

        log.ack(first[0].delivery_id)?;
        log.nack(first[1].delivery_id, "target busy")?;
        assert_eq!(log.pending()?, 1);
        assert_eq!(log.last_error(first[1].delivery_id)?.as_deref(), Some("target busy"));

        let retry = log.poll(10)?;
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempts, 2);
        log.ack(retry[0].delivery_id)?;
        assert_eq!(log.pending()?, 0);

        assert_eq!(log.ack(retry[0].delivery_id), Err(BrokerError::UnknownDelivery(retry[0].delivery_id)));
        Ok(())
    }

    // Test IDs: TLOG-002
    #[test]
    fn reopening_releases_in_flight_deliveries() -> Result<()> {
        let path = unique_temp_db_path();
        {
            let log = SqliteEventLog::open(&path, "inconsistent_interactive")?;
            log.produce(&InconsistentEvent::new(1, InconsistentEventType::TargetMissing, Direction::Src))?;
            assert_eq!(log.poll(1)?.len(), 1);
        }

        let reopened = SqliteEventLog::open(&path, "inconsistent_interactive")?;
        let redelivered = reopened.poll(1)?;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 2);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TLOG-003
    #[test]
    fn topics_are_isolated() -> Result<()> {
        let path = unique_temp_db_path();
        let a = SqliteEventLog::open(&path, "inconsistent_a")?;
        let b = SqliteEventLog::open(&path, "inconsistent_b")?;
        a.produce(&InconsistentEvent::new(1, InconsistentEventType::NotEqual, Direction::Src))?;
        assert!(b.poll(10)?.is_empty());
        assert_eq!(a.poll(10)?.len(), 1);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TLOG-004
    #[test]
    fn acked_rows_are_reclaimed() -> Result<()> {
        let log = SqliteEventLog::open_in_memory("inconsistent_interactive")?;
        for id in 1..=3 {
            log.produce(&InconsistentEvent::new(id, InconsistentEventType::NotEqual, Direction::Src))?;
        }
        let rows = |log: &SqliteEventLog| -> Result<Vec<Row>, StoreError> {
            log.pool.query("SELECT seq FROM inconsistent_events", &[])
        };

        let deliveries = log.poll(10)?;
        log.ack(deliveries[0].delivery_id)?;
        log.ack(deliveries[1].delivery_id)?;
        log.nack(deliveries[2].delivery_id, "target busy")?;

        assert_eq!(rows(&log)?, vec![vec![Value::Integer(deliveries[2].delivery_id)]]);
        assert_eq!(log.pending()?, 1);
        Ok(())
    }
}
