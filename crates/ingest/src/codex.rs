use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde_json::Value;
use usage_core::{SessionRecord, TokenCounters};
use usage_db::Db;
use walkdir::WalkDir;

use crate::fields::{At, find_str};
use crate::pipeline::{IngestOptions, run_pipeline};
use crate::reader::{JsonLine, JsonLines, open_lines};
use crate::record::{
    ContextUpdate, Positioned, RawMeasurement, Record, SkipReason, Slot, StreamIdentity,
};
use crate::registry::Decider;
use crate::strategy::{CODEX, Extractor, ReadFrom, RecordStream};
use crate::types::{IngestError, IngestIssue, IngestStats, Result};

/// Codex CLI session logs, one JSON object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodexExtractor;

impl Extractor for CodexExtractor {
    fn read_identity(&self, location: &Path) -> Result<String> {
        let label = location.display().to_string();
        for item in open_lines(location, None)? {
            let JsonLine { line, value, .. } = item?;
            if find_str(&value, &["type"]) == Some("session_meta") {
                return Ok(session_identity(&value, At::new(&label, line))?.id);
            }
        }
        Err(IngestError::MissingIdentity { location: label })
    }

    /// Resuming from a cursor skips the session header, which the cursor
    /// was recorded after.
    fn records<'a>(&'a self, location: &'a Path, from: &ReadFrom) -> Result<RecordStream<'a>> {
        let lines = open_lines(location, from.cursor.as_ref())?;
        Ok(Box::new(records_from_lines(
            lines,
            location.display().to_string(),
            from.cursor.is_some(),
        )))
    }
}

fn records_from_lines<R: BufRead>(
    lines: JsonLines<R>,
    location: String,
    mut identity_seen: bool,
) -> impl Iterator<Item = Result<Positioned<Record>>> {
    lines.filter_map(move |item| {
        let decoded = item.and_then(|JsonLine { line, end, value }| {
            let record = decode(&value, At::new(&location, line), &mut identity_seen)?;
            Ok(record.map(|record| Positioned {
                position: line,
                end: Some(end),
                record,
            }))
        });
        decoded.transpose()
    })
}

fn decode(value: &Value, at: At<'_>, identity_seen: &mut bool) -> Result<Option<Record>> {
    match find_str(value, &["type"]) {
        Some("session_meta") if !*identity_seen => {
            *identity_seen = true;
            Ok(Some(Record::Identity(session_identity(value, at)?)))
        }
        Some("turn_context") => Ok(Some(Record::Context(turn_context(value, at)?))),
        Some("event_msg") if find_str(value, &["payload", "type"]) == Some("token_count") => {
            token_count(value, at).map(Some)
        }
        _ => Ok(None),
    }
}

fn session_identity(value: &Value, at: At<'_>) -> Result<StreamIdentity> {
    let payload = at.object(value, "payload", "session_meta.payload")?;
    let raw_id = at
        .required(payload, "id", "session_meta.payload.id")?
        .as_str()
        .ok_or_else(|| at.invalid("session_meta.payload.id", "a UUID string"))?;
    let id = at.uuid(raw_id, "session_meta.payload.id")?;
    let started_at = match value.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(_) => Some(at.timestamp(value, "timestamp", "timestamp")?),
    };
    let directory = match payload.get("cwd") {
        None | Some(Value::Null) => None,
        Some(Value::String(cwd)) => Some(cwd.clone()),
        Some(_) => return Err(at.invalid("session_meta.payload.cwd", "a string or null")),
    };
    Ok(StreamIdentity {
        id: id.clone(),
        session: Some(SessionRecord {
            session_id: id,
            started_at,
            directory,
            ..SessionRecord::default()
        }),
    })
}

fn turn_context(value: &Value, at: At<'_>) -> Result<ContextUpdate> {
    let payload = at.object(value, "payload", "turn_context.payload")?;
    let model = match payload.get("model") {
        None => Slot::Keep,
        Some(Value::Null) => Slot::Clear,
        Some(Value::String(model)) => Slot::Set(model.clone()),
        Some(_) => return Err(at.invalid("turn_context.payload.model", "a string or null")),
    };
    let turn_id = match payload.get("turn_id") {
        None | Some(Value::Null) => Slot::Clear,
        Some(Value::String(raw)) => Slot::Set(at.uuid(raw, "turn_context.payload.turn_id")?),
        Some(_) => return Err(at.invalid("turn_context.payload.turn_id", "a UUID or null")),
    };
    Ok(ContextUpdate {
        model,
        turn_id,
        ..ContextUpdate::default()
    })
}

fn token_count(value: &Value, at: At<'_>) -> Result<Record> {
    let info = match token_info(value) {
        None | Some(Value::Null) => return Ok(Record::Skipped(SkipReason::InfoNull)),
        Some(info) if info.is_object() => info,
        Some(_) => return Err(at.invalid("event_msg.payload.info", "an object or null")),
    };
    let cumulative = snapshot(info, "total_token_usage", at)?;
    let incremental = snapshot(info, "last_token_usage", at)?;
    let timestamp = at.timestamp(value, "timestamp", "timestamp")?;
    let mut measurement = RawMeasurement::new(timestamp, incremental);
    measurement.cumulative = Some(cumulative);
    Ok(Record::Measurement(measurement))
}

fn token_info(value: &Value) -> Option<&Value> {
    value.get("payload").and_then(|payload| payload.get("info"))
}

fn snapshot(info: &Value, key: &str, at: At<'_>) -> Result<TokenCounters> {
    let usage = at.object(info, key, key)?;
    let count = |field: &str| at.count(usage, field, &format!("{key}.{field}"));
    Ok(TokenCounters {
        input_tokens: count("input_tokens")?,
        cached_input_tokens: count("cached_input_tokens")?,
        cache_write_tokens: 0,
        output_tokens: count("output_tokens")?,
        reasoning_tokens: count("reasoning_output_tokens")?,
        total_tokens: Some(count("total_tokens")?),
    })
}

/// Every `*.jsonl` under `root`, sorted. Unreadable entries come back as
/// issues; a missing root yields nothing.
pub fn discover_session_files(root: &Path) -> (Vec<PathBuf>, Vec<IngestIssue>) {
    let mut files = Vec::new();
    let mut issues = Vec::new();
    if !root.is_dir() {
        return (files, issues);
    }
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let location = err
                    .path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                tracing::warn!(location = %location, error = %err, "failed to walk session directory");
                issues.push(IngestIssue {
                    location,
                    identity: None,
                    message: err.to_string(),
                });
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().and_then(|value| value.to_str()) == Some("jsonl")
        {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    (files, issues)
}

/// Ingests every session log under `sessions_root`.
pub fn ingest_codex_sessions(
    db: &mut Db,
    sessions_root: &Path,
    decider: &dyn Decider,
    options: &IngestOptions,
) -> Result<IngestStats> {
    let (files, walk_issues) = discover_session_files(sessions_root);
    tracing::info!(
        root = %sessions_root.display(),
        files = files.len(),
        "discovered codex session files"
    );
    let mut stats = run_pipeline(db, &CODEX, files, decider, options)?;
    stats.sources_failed += walk_issues.len();
    stats.issues.extend(walk_issues);
    Ok(stats)
}
