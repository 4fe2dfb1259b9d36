use usage_core::{Fingerprint, OrderKey, ReadCursor, SourceRow, UsageEvent};
use usage_db::Db;

use crate::strategy::StreamStrategy;
use crate::types::Result;

/// File-level gate: an input whose fingerprint matches the recorded one is
/// skipped without opening it.
pub fn is_unchanged(source: &SourceRow, current: &Fingerprint) -> bool {
    source.fingerprint.as_ref() == Some(current)
}

/// The stored read cursor, while it still points into the same file and
/// the file has not shrunk below it. Anything else means a full read.
pub fn resume_cursor(
    source: &SourceRow,
    inode: Option<u64>,
    current: &Fingerprint,
) -> Option<ReadCursor> {
    let cursor = source.read_cursor.as_ref()?;
    (cursor.inode == inode && cursor.byte_offset <= current.size_bytes).then(|| cursor.clone())
}

/// Stream-level gate. The boundary is inclusive so the last committed record
/// is re-admitted and absorbed by the collapse pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamGate {
    checkpoint: Option<OrderKey>,
}

impl StreamGate {
    pub fn open() -> Self {
        Self { checkpoint: None }
    }

    pub fn at(checkpoint: Option<OrderKey>) -> Self {
        Self { checkpoint }
    }

    pub fn checkpoint(&self) -> Option<&OrderKey> {
        self.checkpoint.as_ref()
    }

    pub fn admits(&self, key: &OrderKey) -> bool {
        match &self.checkpoint {
            Some(checkpoint) => key >= checkpoint,
            None => true,
        }
    }
}

/// Where processing of one stream resumes and what it is checked against.
#[derive(Debug, Clone, Default)]
pub struct ResumePlan {
    pub gate: StreamGate,
    /// Committed events at or after the checkpoint.
    pub boundary: Vec<UsageEvent>,
    /// Every committed event, loaded only for full refresh.
    pub history: Vec<UsageEvent>,
}

impl ResumePlan {
    pub fn predecessor(&self) -> Option<&UsageEvent> {
        self.boundary.last()
    }
}

pub fn load_resume(
    db: &Db,
    strategy: &StreamStrategy,
    source_id: &str,
    full_refresh: bool,
) -> Result<ResumePlan> {
    if full_refresh {
        let history = db.usage_events_for_source(strategy.family, source_id)?;
        return Ok(ResumePlan {
            gate: StreamGate::open(),
            boundary: Vec::new(),
            history,
        });
    }
    let checkpoint = db.stream_checkpoint(strategy.family, source_id)?;
    let boundary = match &checkpoint {
        Some(key) => db.usage_events_from(strategy.family, source_id, key)?,
        None => Vec::new(),
    };
    Ok(ResumePlan {
        gate: StreamGate::at(checkpoint),
        boundary,
        history: Vec::new(),
    })
}
