use chrono::{DateTime, Utc};
use usage_core::{SessionRecord, TokenCounters};

/// Three-way update for a context field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Slot<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Slot<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Slot::Set(value),
            None => Slot::Keep,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextUpdate {
    pub model: Slot<String>,
    pub provider: Slot<String>,
    pub agent: Slot<String>,
    pub mode: Slot<String>,
    pub turn_id: Slot<String>,
}

/// Identity metadata found inside a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamIdentity {
    pub id: String,
    pub session: Option<SessionRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    pub timestamp: DateTime<Utc>,
    pub order_ts: DateTime<Utc>,
    pub record_id: Option<String>,
    pub inline: ContextUpdate,
    pub usage: TokenCounters,
    pub cumulative: Option<TokenCounters>,
    pub cost_usd: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<String>,
    pub session: Option<SessionRecord>,
}

impl RawMeasurement {
    pub fn new(timestamp: DateTime<Utc>, usage: TokenCounters) -> Self {
        Self {
            timestamp,
            order_ts: timestamp,
            record_id: None,
            inline: ContextUpdate::default(),
            usage,
            cumulative: None,
            cost_usd: None,
            completed_at: None,
            finish_reason: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InfoNull,
}

/// Typed candidate record produced by an extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Identity(StreamIdentity),
    Context(ContextUpdate),
    Measurement(RawMeasurement),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Positioned<T> {
    pub position: u64,
    /// Byte offset just past the record, for readers that can resume there.
    pub end: Option<u64>,
    pub record: T,
}
