mod checkpoint;
mod codex;
mod context;
mod dedupe;
mod fields;
mod gemini;
mod opencode;
mod paths;
mod pipeline;
mod preprocess;
mod reader;
mod record;
mod registry;
mod strategy;
mod types;

pub use checkpoint::{ResumePlan, StreamGate, is_unchanged, load_resume, resume_cursor};
pub use codex::{CodexExtractor, discover_session_files, ingest_codex_sessions};
pub use context::{ContextPolicy, ContextState, Stamped, Step};
pub use dedupe::{Collapsed, Collapser, validate_history, validate_sequence};
pub use fields::parse_timestamp;
pub use gemini::{GeminiExtractor, GeminiRequest, ingest_gemini};
pub use opencode::{OpenCodeExtractor, identity_for_location, ingest_opencode};
pub use paths::{
    default_codex_home, default_codex_sessions_root, default_opencode_db, resolve_gemini_input,
};
pub use pipeline::{IngestOptions, run_pipeline};
pub use preprocess::{
    ConvertStats, METADATA_RECORD_TYPE, METADATA_SCHEMA_VERSION, PreprocessInput,
    PreprocessOutcome, ProjectMetadata, convert_log, ensure_metadata_line, last_timestamp,
    preprocess, read_project_metadata, resolve_preprocess_input,
};
pub use reader::{ConcatenatedObjects, JsonLine, JsonLines, open_lines};
pub use record::{
    ContextUpdate, Positioned, RawMeasurement, Record, SkipReason, Slot, StreamIdentity,
};
pub use registry::{
    ActiveSelection, AlwaysAllow, AlwaysDeny, AutoRegister, Decider, Decision, reconcile,
    select_active_sources,
};
pub use strategy::{
    CODEX, DedupKeyKind, Extractor, GEMINI, OPENCODE, ReadFrom, RecordStream, StreamStrategy,
    UpsertPolicy, strategy_for,
};
pub use types::{IngestError, IngestIssue, IngestStats, InputStats, Result};
