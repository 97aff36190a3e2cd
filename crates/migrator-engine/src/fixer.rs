use std::sync::Arc;
use std::time::Duration;

use migrator_core::{Delivery, Direction, EventSource, InconsistentEvent, InconsistentEventType};
use migrator_store_sqlite::{ConnPool, Record, StoreError, TableDao};
use tokio_util::sync::CancellationToken;

use crate::call::{blocking, pause, Call};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    Deleted,
    Upserted,
}

/// Repairs one store from the other by overwriting whole rows.
///
/// The event only says where to look; the authoritative row is always re-read
/// at repair time. Every repair is an upsert or a delete, so replaying an
/// event converges to the same state.
pub struct OverrideFixer<T: Record> {
    src: TableDao<T>,
    dst: TableDao<T>,
    columns: Vec<String>,
}

impl<T: Record> OverrideFixer<T> {
    /// Overwrites every column except `id` on conflict.
    #[must_use]
    pub fn new(src: Arc<dyn ConnPool>, dst: Arc<dyn ConnPool>) -> Self {
        let columns = T::COLUMNS.iter().skip(1).map(|column| (*column).to_string()).collect();
        Self { src: TableDao::new(src), dst: TableDao::new(dst), columns }
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    /// (authoritative, repaired) for an event's direction.
    fn sides(&self, direction: Direction) -> (&TableDao<T>, &TableDao<T>) {
        match direction {
            Direction::Src => (&self.src, &self.dst),
            Direction::Dst => (&self.dst, &self.src),
        }
    }

    /// # Errors
    /// Returns an error when the authoritative read or the repair write fails.
    pub fn fix(&self, event: &InconsistentEvent) -> Result<FixOutcome, StoreError> {
        let (base, target) = self.sides(event.direction);
        if event.event_type == InconsistentEventType::BaseMissing {
            target.delete_by_id(event.id)?;
            return Ok(FixOutcome::Deleted);
        }
        match base.find_by_id(event.id)? {
            None => {
                target.delete_by_id(event.id)?;
                Ok(FixOutcome::Deleted)
            }
            Some(row) => {
                target.upsert(&row, &self.columns)?;
                Ok(FixOutcome::Upserted)
            }
        }
    }
}

/// Drains inconsistency events from a broker and applies them through an
/// [`OverrideFixer`]. Failed repairs are nacked so the broker redelivers them.
pub struct FixerConsumer<T: Record> {
    source: Arc<dyn EventSource>,
    fixer: Arc<OverrideFixer<T>>,
    poll_interval: Duration,
    batch_size: usize,
    call_timeout: Duration,
}

impl<T: Record> FixerConsumer<T> {
    #[must_use]
    pub fn new(source: Arc<dyn EventSource>, fixer: OverrideFixer<T>) -> Self {
        Self {
            source,
            fixer: Arc::new(fixer),
            poll_interval: Duration::from_millis(500),
            batch_size: 64,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Consume until cancelled, sleeping `poll_interval` whenever the broker is
    /// empty or unreachable.
    ///
    /// # Errors
    /// Returns an error when a store or broker call panics.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        tracing::info!("fixer consumer started");
        loop {
            match self.poll_once(&cancel).await? {
                None => break,
                Some(0) => {
                    if !pause(&cancel, self.poll_interval).await {
                        break;
                    }
                }
                Some(_) => {}
            }
        }
        tracing::info!("fixer consumer stopped");
        Ok(())
    }

    /// Handle at most one batch. Returns the number of deliveries handled, or
    /// `None` once cancelled.
    ///
    /// # Errors
    /// Returns an error when a store or broker call panics.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> anyhow::Result<Option<usize>> {
        let source = self.source.clone();
        let max = self.batch_size;
        let deliveries =
            match blocking(cancel, self.call_timeout, move || source.poll(max).map_err(StoreError::from))
                .await?
            {
                Call::Cancelled => return Ok(None),
                Call::Done(deliveries) => deliveries,
                Call::Failed(err) => {
                    tracing::warn!(error = %err, "failed to poll inconsistency events");
                    return Ok(Some(0));
                }
            };

        for (idx, delivery) in deliveries.iter().enumerate() {
            if !self.handle(cancel, delivery).await? {
                // Hand back everything not yet applied so it is redelivered.
                for rest in &deliveries[idx..] {
                    self.settle(rest.delivery_id, Some("consumer cancelled")).await?;
                }
                return Ok(None);
            }
        }
        Ok(Some(deliveries.len()))
    }

    /// Returns `false` when cancelled before the repair completed.
    async fn handle(&self, cancel: &CancellationToken, delivery: &Delivery) -> anyhow::Result<bool> {
        let event = match delivery.event() {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(
                    delivery_id = delivery.delivery_id,
                    attempts = delivery.attempts,
                    error = %err,
                    "undecodable inconsistency event"
                );
                self.settle(delivery.delivery_id, Some(&err.to_string())).await?;
                return Ok(true);
            }
        };

        let fixer = self.fixer.clone();
        match blocking(cancel, self.call_timeout, move || fixer.fix(&event)).await? {
            Call::Cancelled => return Ok(false),
            Call::Done(outcome) => {
                tracing::debug!(
                    id = event.id,
                    event_type = %event.event_type,
                    direction = %event.direction,
                    outcome = ?outcome,
                    "repaired inconsistency"
                );
                self.settle(delivery.delivery_id, None).await?;
            }
            Call::Failed(err) => {
                tracing::warn!(
                    id = event.id,
                    event_type = %event.event_type,
                    direction = %event.direction,
                    attempts = delivery.attempts,
                    error = %err,
                    "repair failed, leaving event for redelivery"
                );
                self.settle(delivery.delivery_id, Some(&err.to_string())).await?;
            }
        }
        Ok(true)
    }

    /// Ack when `failure` is `None`, nack otherwise. Settling is not cancellable.
    async fn settle(&self, delivery_id: i64, failure: Option<&str>) -> anyhow::Result<()> {
        let source = self.source.clone();
        let failure = failure.map(str::to_string);
        let outcome = blocking(&CancellationToken::new(), self.call_timeout, move || {
            match failure {
                None => source.ack(delivery_id),
                Some(reason) => source.nack(delivery_id, &reason),
            }
            .map_err(StoreError::from)
        })
        .await?;
        if let Call::Failed(err) = outcome {
            tracing::warn!(delivery_id, error = %err, "failed to settle delivery");
        }
        Ok(())
    }
}
