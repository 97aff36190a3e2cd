use std::sync::Arc;
use std::time::Duration;

use migrator_core::{Direction, EventProducer, InconsistentEvent, InconsistentEventType};
use migrator_store_sqlite::{missing_ids, ConnPool, Record, StoreError, TableDao};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::call::{blocking, pause, Call};

pub const DEFAULT_BATCH_SIZE: i64 = 100;
/// A reverse-scan batch is bound as one `IN (...)` list, so it must stay well
/// under SQLite's bound-parameter limit.
pub const MAX_BATCH_SIZE: i64 = 10_000;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// How the forward scan walks the base store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Every row, ordered by id.
    Full,
    /// Rows updated at or after `utime`, ordered by update time.
    Incremental { utime: i64 },
}

/// Per-direction counters for one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub rows_checked: u64,
    pub events_emitted: u64,
    pub errors_skipped: u64,
}

/// Compares a base store against a target store in both directions.
///
/// Both scans only read. A row whose query fails is logged and skipped for the
/// rest of the pass; it is picked up again by the next pass over the table.
pub struct Validator<T: Record> {
    base: TableDao<T>,
    target: TableDao<T>,
    direction: Direction,
    producer: Arc<dyn EventProducer>,
    mode: ScanMode,
    batch_size: i64,
    sleep_interval: Option<Duration>,
    query_timeout: Duration,
}

impl<T: Record> Validator<T> {
    #[must_use]
    pub fn new(
        base: Arc<dyn ConnPool>,
        target: Arc<dyn ConnPool>,
        direction: Direction,
        producer: Arc<dyn EventProducer>,
    ) -> Self {
        Self {
            base: TableDao::new(base),
            target: TableDao::new(target),
            direction,
            producer,
            mode: ScanMode::Full,
            batch_size: DEFAULT_BATCH_SIZE,
            sleep_interval: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn full(mut self) -> Self {
        self.mode = ScanMode::Full;
        self
    }

    #[must_use]
    pub fn incremental(mut self, utime: i64) -> Self {
        self.mode = ScanMode::Incremental { utime };
        self
    }

    /// `None` ends each scan when it runs out of rows; `Some` makes the scans
    /// sleep and resume until cancelled.
    #[must_use]
    pub fn sleep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sleep_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    #[must_use]
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Run the forward and reverse scans concurrently until both finish, one
    /// fails, or `cancel` fires. Cancellation is not an error.
    ///
    /// # Errors
    /// Returns an error when a store call panics.
    pub async fn validate(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (forward, reverse) =
            tokio::try_join!(self.validate_base_to_target(&cancel), self.validate_target_to_base(&cancel))?;
        tracing::info!(
            direction = %self.direction,
            cancelled = cancel.is_cancelled(),
            forward_rows = forward.rows_checked,
            forward_events = forward.events_emitted,
            forward_skipped = forward.errors_skipped,
            reverse_rows = reverse.rows_checked,
            reverse_events = reverse.events_emitted,
            reverse_skipped = reverse.errors_skipped,
            "validation pass finished"
        );
        Ok(())
    }

    /// Sleeps at end of data when configured. Returns `false` when the scan should stop.
    async fn wait_for_more(&self, cancel: &CancellationToken) -> bool {
        match self.sleep_interval {
            Some(interval) => pause(cancel, interval).await,
            None => false,
        }
    }

    pub(crate) async fn validate_base_to_target(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut offset: i64 = 0;
        loop {
            let base = self.base.clone();
            let mode = self.mode;
            let fetched = blocking(cancel, self.query_timeout, move || match mode {
                ScanMode::Full => base.find_nth_by_id(offset),
                ScanMode::Incremental { utime } => base.find_nth_updated_since(utime, offset),
            })
            .await?;

            let src = match fetched {
                Call::Cancelled => return Ok(report),
                Call::Done(Some(src)) => src,
                Call::Done(None) => {
                    if self.wait_for_more(cancel).await {
                        continue;
                    }
                    return Ok(report);
                }
                Call::Failed(err) => {
                    tracing::error!(
                        direction = %self.direction,
                        offset,
                        error = %err,
                        "base -> target: failed to read base row, skipping"
                    );
                    report.errors_skipped += 1;
                    offset += 1;
                    continue;
                }
            };

            report.rows_checked += 1;
            let id = src.id();
            let target = self.target.clone();
            match blocking(cancel, self.query_timeout, move || target.find_by_id(id)).await? {
                Call::Cancelled => return Ok(report),
                Call::Done(None) => {
                    self.notify(id, InconsistentEventType::TargetMissing, &mut report).await?;
                }
                Call::Done(Some(dst)) => {
                    if !src.compare_to(&dst) {
                        self.notify(id, InconsistentEventType::NotEqual, &mut report).await?;
                    }
                }
                Call::Failed(err) => {
                    tracing::error!(
                        direction = %self.direction,
                        id,
                        error = %err,
                        "base -> target: failed to read target row"
                    );
                    report.errors_skipped += 1;
                }
            }
            offset += 1;
        }
    }

    pub(crate) async fn validate_target_to_base(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut offset: i64 = 0;
        loop {
            let target = self.target.clone();
            let limit = self.batch_size;
            let ids = match blocking(cancel, self.query_timeout, move || target.ids_page(offset, limit))
                .await?
            {
                Call::Cancelled => return Ok(report),
                Call::Done(ids) => ids,
                Call::Failed(err) => {
                    tracing::error!(
                        direction = %self.direction,
                        offset,
                        error = %err,
                        "target -> base: failed to read target batch, skipping"
                    );
                    report.errors_skipped += 1;
                    offset += self.batch_size;
                    continue;
                }
            };

            if ids.is_empty() {
                if self.wait_for_more(cancel).await {
                    continue;
                }
                return Ok(report);
            }

            report.rows_checked += ids.len() as u64;
            let base = self.base.clone();
            let lookup = ids.clone();
            match blocking(cancel, self.query_timeout, move || base.ids_in(&lookup)).await? {
                Call::Cancelled => return Ok(report),
                // Nothing from this batch exists in base; no need to diff.
                Call::Done(present) if present.is_empty() => {
                    self.notify_base_missing(&ids, &mut report).await?;
                }
                Call::Done(present) => {
                    self.notify_base_missing(&missing_ids(&ids, &present), &mut report).await?;
                }
                Call::Failed(err) => {
                    tracing::error!(
                        direction = %self.direction,
                        offset,
                        error = %err,
                        "target -> base: failed to look up base ids"
                    );
                    report.errors_skipped += 1;
                }
            }

            let fetched = i64::try_from(ids.len()).unwrap_or(i64::MAX);
            offset += fetched;
            if fetched < self.batch_size && !self.wait_for_more(cancel).await {
                return Ok(report);
            }
        }
    }

    async fn notify_base_missing(&self, ids: &[i64], report: &mut ScanReport) -> anyhow::Result<()> {
        for &id in ids {
            self.notify(id, InconsistentEventType::BaseMissing, report).await?;
        }
        Ok(())
    }

    /// Publish one event. Publishing is not tied to the scan's cancellation and
    /// a broker failure is logged rather than stopping the scan.
    async fn notify(
        &self,
        id: i64,
        event_type: InconsistentEventType,
        report: &mut ScanReport,
    ) -> anyhow::Result<()> {
        let event = InconsistentEvent::new(id, event_type, self.direction);
        let producer = self.producer.clone();
        let outcome = blocking(&CancellationToken::new(), self.query_timeout, move || {
            producer.produce(&event).map_err(StoreError::from)
        })
        .await?;
        match outcome {
            Call::Done(()) => report.events_emitted += 1,
            Call::Failed(err) => {
                tracing::error!(
                    id,
                    event_type = %event_type,
                    direction = %self.direction,
                    error = %err,
                    "failed to publish inconsistency event"
                );
            }
            Call::Cancelled => {}
        }
        Ok(())
    }
}
