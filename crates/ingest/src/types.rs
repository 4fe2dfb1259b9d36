use std::io;

use serde::Serialize;

/// Ingest summary returned after a run over one family's inputs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub sources_scanned: usize,
    pub sources_ingested: usize,
    pub sources_skipped_unchanged: usize,
    pub sources_missing: usize,
    pub sources_deactivated: usize,
    pub sources_failed: usize,
    pub records_seen: usize,
    pub records_kept: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub skipped_info_null: usize,
    pub skipped_before_checkpoint: usize,
    pub duplicates_collapsed: usize,
    pub sessions_upserted: usize,
    pub cancelled: bool,
    pub issues: Vec<IngestIssue>,
}

impl IngestStats {
    pub fn has_failures(&self) -> bool {
        self.sources_failed > 0 || !self.issues.is_empty()
    }

    pub(crate) fn absorb(&mut self, input: &InputStats) {
        self.records_seen += input.records_seen;
        self.records_kept += input.records_kept;
        self.skipped_info_null += input.skipped_info_null;
        self.skipped_before_checkpoint += input.skipped_before_checkpoint;
        self.duplicates_collapsed += input.duplicates_collapsed;
    }

    pub(crate) fn merge(&mut self, other: IngestStats) {
        self.sources_scanned += other.sources_scanned;
        self.sources_ingested += other.sources_ingested;
        self.sources_skipped_unchanged += other.sources_skipped_unchanged;
        self.sources_missing += other.sources_missing;
        self.sources_deactivated += other.sources_deactivated;
        self.sources_failed += other.sources_failed;
        self.records_seen += other.records_seen;
        self.records_kept += other.records_kept;
        self.records_inserted += other.records_inserted;
        self.records_updated += other.records_updated;
        self.records_unchanged += other.records_unchanged;
        self.skipped_info_null += other.skipped_info_null;
        self.skipped_before_checkpoint += other.skipped_before_checkpoint;
        self.duplicates_collapsed += other.duplicates_collapsed;
        self.sessions_upserted += other.sessions_upserted;
        self.cancelled |= other.cancelled;
        self.issues.extend(other.issues);
    }

    pub(crate) fn fail(&mut self, location: &str, identity: Option<&str>, err: &IngestError) {
        tracing::error!(location, identity, error = %err, "input failed");
        self.sources_failed += 1;
        self.issues.push(IngestIssue {
            location: location.to_string(),
            identity: identity.map(str::to_string),
            message: err.to_string(),
        });
    }

    /// Counter lines in `key=value` form, in a stable order.
    pub fn counter_lines(&self) -> Vec<String> {
        let counters = [
            ("sources_scanned", self.sources_scanned),
            ("sources_ingested", self.sources_ingested),
            ("sources_skipped_unchanged", self.sources_skipped_unchanged),
            ("sources_missing", self.sources_missing),
            ("sources_deactivated", self.sources_deactivated),
            ("sources_failed", self.sources_failed),
            ("records_seen", self.records_seen),
            ("records_kept", self.records_kept),
            ("records_inserted", self.records_inserted),
            ("records_updated", self.records_updated),
            ("records_unchanged", self.records_unchanged),
            ("skipped_info_null", self.skipped_info_null),
            ("skipped_before_checkpoint", self.skipped_before_checkpoint),
            ("duplicates_collapsed", self.duplicates_collapsed),
            ("sessions_upserted", self.sessions_upserted),
        ];
        counters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect()
    }
}

/// Counters for a single input before it is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputStats {
    pub records_seen: usize,
    pub records_kept: usize,
    pub skipped_info_null: usize,
    pub skipped_before_checkpoint: usize,
    pub duplicates_collapsed: usize,
}

/// An input that failed and was rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct IngestIssue {
    pub location: String,
    pub identity: Option<String>,
    pub message: String,
}

/// Errors emitted by the ingest pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{location}: io error: {source}")]
    Io { location: String, source: io::Error },
    #[error("{location}:{position}: read error: {source}")]
    Read {
        location: String,
        position: u64,
        source: io::Error,
    },
    #[error("{location}:{position}: malformed JSON: {message}")]
    MalformedJson {
        location: String,
        position: u64,
        message: String,
    },
    #[error("{location}:{position}: missing required field `{field}`")]
    MissingField {
        location: String,
        position: u64,
        field: String,
    },
    #[error("{location}:{position}: field `{field}` must be {expected}")]
    InvalidField {
        location: String,
        position: u64,
        field: String,
        expected: &'static str,
    },
    #[error("{location}:{position}: measurement has no model in effect")]
    Unattributed { location: String, position: u64 },
    #[error("{location}: no stream identity record before the first measurement")]
    MissingIdentity { location: String },
    #[error("{location}:{position}: stream identity {found} does not match registered identity {expected}")]
    IdentityMismatch {
        location: String,
        position: u64,
        expected: String,
        found: String,
    },
    #[error(
        "{location}: conflicting payloads for dedup key {key} at positions {first} and {second}"
    )]
    DuplicateConflict {
        location: String,
        key: String,
        first: u64,
        second: u64,
    },
    #[error(
        "{location}:{position}: cumulative total {current} does not exceed {previous} at position {previous_position}"
    )]
    NonMonotonic {
        location: String,
        position: u64,
        previous_position: u64,
        previous: u64,
        current: u64,
    },
    #[error(
        "{location}:{position}: {field} advanced by {expected} since position {previous_position} but the record reports {actual}"
    )]
    DeltaMismatch {
        location: String,
        position: u64,
        previous_position: u64,
        field: &'static str,
        expected: i128,
        actual: u64,
    },
    #[error("{location}: newest record {newest} is behind checkpoint {checkpoint}; input was rewritten")]
    AppendOnlyViolation {
        location: String,
        newest: String,
        checkpoint: String,
    },
    #[error("{location}: assistant message {message_id} has no matching session or project")]
    OrphanRow { location: String, message_id: String },
    #[error("{location}: export query failed: {source}")]
    Export {
        location: String,
        source: rusqlite::Error,
    },
    #[error("source conflict: {0}")]
    SourceConflict(String),
    #[error("confirmation declined: {0}")]
    ConfirmationDeclined(String),
    #[error("{location}: {message}")]
    InvalidInput { location: String, message: String },
    #[error("{location}: required source tables missing: {missing}")]
    SourceSchema { location: String, missing: String },
    #[error("db error: {0}")]
    Db(#[from] usage_db::DbError),
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl IngestError {
    /// Errors that abort the whole run rather than a single input.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Db(_) | IngestError::SourceSchema { .. } | IngestError::WorkerPool(_)
        )
    }

    pub(crate) fn io(location: &str, source: io::Error) -> Self {
        IngestError::Io {
            location: location.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
