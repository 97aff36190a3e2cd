use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const EVENT_SCHEMA_VERSION: &str = "inconsistent-event.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PatternError {
    #[error("unknown pattern: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BrokerError {
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("failed to decode event: {0}")]
    Decode(String),
    #[error("event schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },
    #[error("unknown delivery: {0}")]
    UnknownDelivery(i64),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A row participating in a migration.
///
/// Two entities with the same `id` describe the same logical record on both
/// stores. `compare_to` must be reflexive and must ignore columns the stores
/// are allowed to disagree on.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> i64;

    fn compare_to(&self, other: &Self) -> bool;
}

/// Traffic routing mode of the dual-write layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    #[default]
    SrcOnly,
    SrcFirst,
    DstFirst,
    DstOnly,
}

impl Pattern {
    pub const ALL: [Self; 4] = [Self::SrcOnly, Self::SrcFirst, Self::DstFirst, Self::DstOnly];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SrcOnly => "src_only",
            Self::SrcFirst => "src_first",
            Self::DstFirst => "dst_first",
            Self::DstOnly => "dst_only",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "src_only" => Some(Self::SrcOnly),
            "src_first" => Some(Self::SrcFirst),
            "dst_first" => Some(Self::DstFirst),
            "dst_only" => Some(Self::DstOnly),
            _ => None,
        }
    }

    /// Whether reads (and the authoritative half of writes) go to the source store.
    #[must_use]
    pub fn reads_from_src(self) -> bool {
        matches!(self, Self::SrcOnly | Self::SrcFirst)
    }

    /// Whether writes are mirrored onto the second store.
    #[must_use]
    pub fn is_dual_write(self) -> bool {
        matches!(self, Self::SrcFirst | Self::DstFirst)
    }

    /// The store that validation treats as base while this pattern serves traffic.
    #[must_use]
    pub fn direction(self) -> Direction {
        if self.reads_from_src() {
            Direction::Src
        } else {
            Direction::Dst
        }
    }

    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::SrcOnly => 0,
            Self::SrcFirst => 1,
            Self::DstFirst => 2,
            Self::DstOnly => 3,
        }
    }

    /// # Errors
    /// Returns `PatternError::Unknown` for codes that no pattern encodes to.
    pub fn from_u8(value: u8) -> Result<Self, PatternError> {
        match value {
            0 => Ok(Self::SrcOnly),
            1 => Ok(Self::SrcFirst),
            2 => Ok(Self::DstFirst),
            3 => Ok(Self::DstOnly),
            other => Err(PatternError::Unknown(format!("code {other}"))),
        }
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| PatternError::Unknown(s.to_string()))
    }
}

/// Which store was authoritative for the comparison that produced an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Direction {
    #[serde(rename = "SRC")]
    Src,
    #[serde(rename = "DST")]
    Dst,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dst => "DST",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum InconsistentEventType {
    #[serde(rename = "neq")]
    NotEqual,
    #[serde(rename = "target_missing")]
    TargetMissing,
    #[serde(rename = "base_missing")]
    BaseMissing,
}

impl InconsistentEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotEqual => "neq",
            Self::TargetMissing => "target_missing",
            Self::BaseMissing => "base_missing",
        }
    }
}

impl Display for InconsistentEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct InconsistentEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: InconsistentEventType,
    pub direction: Direction,
}

impl InconsistentEvent {
    #[must_use]
    pub fn new(id: i64, event_type: InconsistentEventType, direction: Direction) -> Self {
        Self { id, event_type, direction }
    }
}

/// Versioned wire shape carried by every broker.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventEnvelope {
    pub schema_version: String,
    pub topic: String,
    pub event: InconsistentEvent,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(topic: impl Into<String>, event: InconsistentEvent) -> Self {
        Self { schema_version: EVENT_SCHEMA_VERSION.to_string(), topic: topic.into(), event }
    }

    /// # Errors
    /// Returns an error when the envelope cannot be serialised.
    pub fn to_json(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|err| BrokerError::Encode(err.to_string()))
    }

    /// Decode an envelope and reject any schema version other than the current one.
    ///
    /// # Errors
    /// Returns an error for malformed payloads or a foreign schema version.
    pub fn from_json(payload: &str) -> Result<Self, BrokerError> {
        let envelope: Self =
            serde_json::from_str(payload).map_err(|err| BrokerError::Decode(err.to_string()))?;
        if envelope.schema_version != EVENT_SCHEMA_VERSION {
            return Err(BrokerError::SchemaMismatch {
                expected: EVENT_SCHEMA_VERSION.to_string(),
                found: envelope.schema_version,
            });
        }
        Ok(envelope)
    }
}

/// One delivery attempt handed to a consumer. The payload stays encoded until
/// the consumer asks for it so that a bad payload can be nacked like any other
/// failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Delivery {
    pub delivery_id: i64,
    pub attempts: u32,
    pub payload: String,
}

impl Delivery {
    /// # Errors
    /// Returns an error when the payload is not a current-version envelope.
    pub fn event(&self) -> Result<InconsistentEvent, BrokerError> {
        EventEnvelope::from_json(&self.payload).map(|envelope| envelope.event)
    }
}

pub trait EventProducer: Send + Sync {
    /// # Errors
    /// Returns an error when the event could not be handed to the broker.
    fn produce(&self, event: &InconsistentEvent) -> Result<(), BrokerError>;
}

/// At-least-once consumption. Deliveries that are neither acked nor nacked
/// stay in flight; nacked deliveries come back on a later `poll`.
pub trait EventSource: Send + Sync {
    /// # Errors
    /// Returns an error when the broker cannot be read.
    fn poll(&self, max: usize) -> Result<Vec<Delivery>, BrokerError>;

    /// # Errors
    /// Returns an error when the delivery is unknown or the broker cannot be written.
    fn ack(&self, delivery_id: i64) -> Result<(), BrokerError>;

    /// # Errors
    /// Returns an error when the delivery is unknown or the broker cannot be written.
    fn nack(&self, delivery_id: i64, reason: &str) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    next_id: i64,
    published: Vec<String>,
    queue: VecDeque<Delivery>,
    in_flight: BTreeMap<i64, Delivery>,
}

/// In-process event log implementing both broker halves.
#[derive(Debug)]
pub struct MemoryEventLog {
    topic: String,
    inner: Mutex<MemoryLogInner>,
}

impl MemoryEventLog {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), inner: Mutex::new(MemoryLogInner::default()) }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Every event ever produced, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<InconsistentEvent> {
        self.inner
            .lock()
            .published
            .iter()
            .filter_map(|payload| EventEnvelope::from_json(payload).ok())
            .map(|envelope| envelope.event)
            .collect()
    }

    /// Deliveries waiting to be polled or acked.
    #[must_use]
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() + inner.in_flight.len()
    }

    /// Append a raw payload, bypassing encoding. Used to inject foreign schema versions.
    pub fn push_raw(&self, payload: impl Into<String>) {
        let mut inner = self.inner.lock();
        let payload = payload.into();
        inner.next_id += 1;
        let delivery = Delivery { delivery_id: inner.next_id, attempts: 0, payload: payload.clone() };
        inner.published.push(payload);
        inner.queue.push_back(delivery);
    }
}

impl EventProducer for MemoryEventLog {
    fn produce(&self, event: &InconsistentEvent) -> Result<(), BrokerError> {
        let payload = EventEnvelope::new(self.topic.clone(), *event).to_json()?;
        self.push_raw(payload);
        Ok(())
    }
}

impl EventSource for MemoryEventLog {
    fn poll(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut delivery) = inner.queue.pop_front() else {
                break;
            };
            delivery.attempts += 1;
            inner.in_flight.insert(delivery.delivery_id, delivery.clone());
            out.push(delivery);
        }
        Ok(out)
    }

    fn ack(&self, delivery_id: i64) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .in_flight
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery_id))
    }

    fn nack(&self, delivery_id: i64, _reason: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let delivery =
            inner.in_flight.remove(&delivery_id).ok_or(BrokerError::UnknownDelivery(delivery_id))?;
        inner.queue.push_back(delivery);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    // Test IDs: TCORE-001
    #[test]
    fn pattern_names_round_trip_and_reject_unknown() -> Result<()> {
        for pattern in Pattern::ALL {
            assert_eq!(pattern.as_str().parse::<Pattern>()?, pattern);
            assert_eq!(Pattern::from_u8(pattern.to_u8())?, pattern);
        }
        assert_eq!(
            "src_last".parse::<Pattern>(),
            Err(PatternError::Unknown("src_last".to_string()))
        );
        assert!(Pattern::from_u8(9).is_err());
        assert_eq!(Pattern::default(), Pattern::SrcOnly);
        Ok(())
    }

    // Test IDs: TCORE-002
    #[test]
    fn pattern_selects_validation_direction() {
        assert_eq!(Pattern::SrcOnly.direction(), Direction::Src);
        assert_eq!(Pattern::SrcFirst.direction(), Direction::Src);
        assert_eq!(Pattern::DstFirst.direction(), Direction::Dst);
        assert_eq!(Pattern::DstOnly.direction(), Direction::Dst);
        assert!(Pattern::SrcFirst.is_dual_write());
        assert!(!Pattern::DstOnly.is_dual_write());
    }

    // Test IDs: TCORE-003
    #[test]
    fn envelope_uses_stable_wire_names() -> Result<()> {
        let event = InconsistentEvent::new(42, InconsistentEventType::TargetMissing, Direction::Dst);
        let json = EventEnvelope::new("inconsistent_interactive", event).to_json()?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(value["event"]["id"], 42);
        assert_eq!(value["event"]["type"], "target_missing");
        assert_eq!(value["event"]["direction"], "DST");
        Ok(())
    }

    // Test IDs: TCORE-004
    #[test]
    fn envelope_rejects_foreign_schema_version() {
        let payload = r#"{"schema_version":"inconsistent-event.v0","topic":"t","event":{"id":1,"type":"neq","direction":"SRC"}}"#;
        match EventEnvelope::from_json(payload) {
            Err(BrokerError::SchemaMismatch { found, .. }) => {
                assert_eq!(found, "inconsistent-event.v0");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    // Test IDs: TCORE-005
    #[test]
    fn memory_log_redelivers_nacked_events() -> Result<()> {
        let log = MemoryEventLog::new("inconsistent_interactive");
        log.produce(&InconsistentEvent::new(1, InconsistentEventType::NotEqual, Direction::Src))?;
        log.produce(&InconsistentEvent::new(2, InconsistentEventType::BaseMissing, Direction::Src))?;

        let first = log.poll(10)?;
        assert_eq!(first.len(), 2);
        log.ack(first[0].delivery_id)?;
        log.nack(first[1].delivery_id, "target locked")?;
        assert_eq!(log.pending(), 1);

        let second = log.poll(10)?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);
        assert_eq!(second[0].event()?.id, 2);
        log.ack(second[0].delivery_id)?;

        assert_eq!(log.pending(), 0);
        assert_eq!(log.published().len(), 2);
        assert_eq!(log.ack(second[0].delivery_id), Err(BrokerError::UnknownDelivery(2)));
        Ok(())
    }
}
