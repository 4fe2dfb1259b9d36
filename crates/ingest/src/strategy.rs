use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use usage_core::{
    Family, Fingerprint, KeyPart, OrderKey, RateLookup, ReadCursor, TokenField, UsageEvent,
    estimate_cost,
};
use usage_db::format_ts;

use crate::codex::CodexExtractor;
use crate::context::{ContextPolicy, Stamped};
use crate::gemini::GeminiExtractor;
use crate::opencode::OpenCodeExtractor;
use crate::record::{Positioned, Record};
use crate::types::{IngestError, Result};

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Positioned<Record>>> + 'a>;

/// Format-specific reader for one family of inputs.
pub trait Extractor: Sync {
    /// Durable identity stored inside the input.
    fn read_identity(&self, location: &Path) -> Result<String>;

    /// Candidate records in stream order, starting where `from` allows.
    fn records<'a>(&'a self, location: &'a Path, from: &ReadFrom) -> Result<RecordStream<'a>>;

    fn fingerprint(&self, location: &Path) -> Result<Fingerprint> {
        file_fingerprint(location)
    }
}

/// Where an extractor may start reading. Both parts are hints; a reader
/// that ignores them starts from the beginning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadFrom {
    /// Readers that can seek by ordering key may skip records before it.
    pub checkpoint: Option<OrderKey>,
    /// Position left by an earlier read of the same file.
    pub cursor: Option<ReadCursor>,
}

pub(crate) fn file_inode(location: &Path) -> Option<u64> {
    let metadata = fs::metadata(location).ok()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}

pub(crate) fn file_fingerprint(location: &Path) -> Result<Fingerprint> {
    let label = location.display().to_string();
    let metadata = fs::metadata(location).map_err(|err| IngestError::io(&label, err))?;
    let modified = metadata
        .modified()
        .map_err(|err| IngestError::io(&label, err))?;
    Ok(Fingerprint {
        size_bytes: metadata.len(),
        mtime: DateTime::<Utc>::from(modified),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupKeyKind {
    /// The cumulative total counter; also the ordering tie-breaker.
    CumulativeTotal,
    /// Event timestamp plus model.
    TimestampModel,
    /// Upstream record id.
    RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPolicy {
    /// A recurring key must carry the payload already stored.
    Immutable,
    /// A recurring key replaces the stored row.
    LatestWins,
}

/// Everything that distinguishes one family's pipeline from another's.
pub struct StreamStrategy {
    pub family: Family,
    pub extractor: &'static dyn Extractor,
    pub dedup_key: DedupKeyKind,
    pub delta_fields: &'static [TokenField],
    pub context: ContextPolicy,
    pub upsert: UpsertPolicy,
    pub append_only: bool,
    pub identity_in_stream: bool,
}

pub static CODEX: StreamStrategy = StreamStrategy {
    family: Family::Codex,
    extractor: &CodexExtractor,
    dedup_key: DedupKeyKind::CumulativeTotal,
    delta_fields: &[
        TokenField::Input,
        TokenField::CachedInput,
        TokenField::Output,
        TokenField::Reasoning,
        TokenField::Total,
    ],
    context: ContextPolicy {
        require_model: true,
        carry_forward: true,
    },
    upsert: UpsertPolicy::Immutable,
    append_only: true,
    identity_in_stream: true,
};

pub static GEMINI: StreamStrategy = StreamStrategy {
    family: Family::Gemini,
    extractor: &GeminiExtractor,
    dedup_key: DedupKeyKind::TimestampModel,
    delta_fields: &[],
    context: ContextPolicy {
        require_model: true,
        carry_forward: true,
    },
    upsert: UpsertPolicy::Immutable,
    append_only: true,
    identity_in_stream: true,
};

pub static OPENCODE: StreamStrategy = StreamStrategy {
    family: Family::OpenCode,
    extractor: &OpenCodeExtractor,
    dedup_key: DedupKeyKind::RecordId,
    delta_fields: &[],
    context: ContextPolicy {
        require_model: false,
        carry_forward: false,
    },
    upsert: UpsertPolicy::LatestWins,
    append_only: false,
    identity_in_stream: false,
};

pub fn strategy_for(family: Family) -> &'static StreamStrategy {
    match family {
        Family::Codex => &CODEX,
        Family::Gemini => &GEMINI,
        Family::OpenCode => &OPENCODE,
    }
}

impl StreamStrategy {
    pub fn is_monotonic(&self) -> bool {
        self.dedup_key == DedupKeyKind::CumulativeTotal
    }

    /// Turns a stamped measurement into a keyed event for `source_id`.
    pub fn build_event(
        &self,
        source_id: &str,
        session_id: Option<String>,
        stamped: Stamped,
        location: &str,
        rates: Option<&dyn RateLookup>,
    ) -> Result<UsageEvent> {
        let Stamped {
            position,
            context,
            measurement,
        } = stamped;
        let (dedup_key, tiebreak) = match self.dedup_key {
            DedupKeyKind::CumulativeTotal => {
                let total = measurement
                    .cumulative
                    .and_then(|cumulative| cumulative.total_tokens)
                    .ok_or_else(|| IngestError::MissingField {
                        location: location.to_string(),
                        position,
                        field: "cumulative total_tokens".to_string(),
                    })?;
                let ordinal = i64::try_from(total).map_err(|_| IngestError::InvalidField {
                    location: location.to_string(),
                    position,
                    field: "cumulative total_tokens".to_string(),
                    expected: "at most i64::MAX",
                })?;
                (total.to_string(), KeyPart::Int(ordinal))
            }
            DedupKeyKind::TimestampModel => {
                let model = context
                    .model
                    .clone()
                    .ok_or_else(|| IngestError::Unattributed {
                        location: location.to_string(),
                        position,
                    })?;
                (
                    format!("{}|{}", format_ts(&measurement.timestamp), model),
                    KeyPart::Text(model),
                )
            }
            DedupKeyKind::RecordId => {
                let id = measurement
                    .record_id
                    .clone()
                    .ok_or_else(|| IngestError::MissingField {
                        location: location.to_string(),
                        position,
                        field: "id".to_string(),
                    })?;
                (id.clone(), KeyPart::Text(id))
            }
        };
        let cost_usd = measurement.cost_usd.or_else(|| {
            let rates = rates?;
            let model = context.model.as_deref()?;
            estimate_cost(rates, model, context.provider.as_deref(), &measurement.usage)
        });
        Ok(UsageEvent {
            family: self.family,
            source_id: source_id.to_string(),
            dedup_key,
            order: OrderKey {
                ts: measurement.order_ts,
                tiebreak,
            },
            position,
            event_ts: measurement.timestamp,
            session_id,
            context,
            usage: measurement.usage,
            cumulative: measurement.cumulative,
            cost_usd,
            completed_at: measurement.completed_at,
            finish_reason: measurement.finish_reason,
        })
    }
}
