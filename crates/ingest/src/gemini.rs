use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde_json::Value;
use usage_core::{Family, TokenCounters};
use usage_db::Db;

use crate::fields::{At, find_str};
use crate::paths::resolve_gemini_input;
use crate::pipeline::{IngestOptions, run_pipeline};
use crate::preprocess::{ProjectMetadata, read_project_metadata};
use crate::reader::{JsonLine, JsonLines, open_lines};
use crate::record::{Positioned, RawMeasurement, Record, Slot, StreamIdentity};
use crate::registry::{Decider, select_active_sources};
use crate::strategy::{Extractor, GEMINI, ReadFrom, RecordStream};
use crate::types::{IngestStats, Result};

const API_RESPONSE: &str = "gemini_cli.api_response";

/// Normalized Gemini CLI telemetry: a metadata line then one event per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiExtractor;

impl Extractor for GeminiExtractor {
    fn read_identity(&self, location: &Path) -> Result<String> {
        Ok(read_project_metadata(location)?.project_id)
    }

    fn records<'a>(&'a self, location: &'a Path, from: &ReadFrom) -> Result<RecordStream<'a>> {
        let lines = open_lines(location, from.cursor.as_ref())?;
        Ok(Box::new(records_from_lines(lines, location.display().to_string())))
    }
}

fn records_from_lines<R: BufRead>(
    lines: JsonLines<R>,
    location: String,
) -> impl Iterator<Item = Result<Positioned<Record>>> {
    lines.filter_map(move |item| {
        let decoded = item.and_then(|JsonLine { line, end, value }| {
            let record = decode(&value, At::new(&location, line))?;
            Ok(record.map(|record| Positioned {
                position: line,
                end: Some(end),
                record,
            }))
        });
        decoded.transpose()
    })
}

fn decode(value: &Value, at: At<'_>) -> Result<Option<Record>> {
    if at.position == 1 {
        return Ok(ProjectMetadata::from_value(value).ok().map(|metadata| {
            Record::Identity(StreamIdentity {
                id: metadata.project_id,
                session: None,
            })
        }));
    }
    if find_str(value, &["attributes", "event.name"]) != Some(API_RESPONSE) {
        return Ok(None);
    }
    let attributes = at.object(value, "attributes", "attributes")?;
    let timestamp = at.timestamp(attributes, "event.timestamp", "attributes.event.timestamp")?;
    let model = match at.required(attributes, "model", "attributes.model")? {
        Value::String(model) if !model.trim().is_empty() => model.clone(),
        _ => return Err(at.invalid("attributes.model", "a non-empty string")),
    };
    let count = |key: &str| at.count(attributes, key, &format!("attributes.{key}"));
    let usage = TokenCounters {
        input_tokens: count("input_token_count")?,
        cached_input_tokens: count("cached_content_token_count")?,
        cache_write_tokens: 0,
        output_tokens: count("output_token_count")?,
        reasoning_tokens: count("thoughts_token_count")?,
        total_tokens: Some(count("total_token_count")?),
    };
    let mut measurement = RawMeasurement::new(timestamp, usage);
    measurement.inline.model = Slot::Set(model);
    Ok(Some(Record::Measurement(measurement)))
}

/// Which Gemini inputs one run covers.
#[derive(Debug, Clone, Default)]
pub struct GeminiRequest {
    pub inputs: Vec<PathBuf>,
    pub all_active: bool,
    pub auto_deactivate: bool,
}

pub fn ingest_gemini(
    db: &mut Db,
    request: &GeminiRequest,
    decider: &dyn Decider,
    options: &IngestOptions,
) -> Result<IngestStats> {
    let mut preflight = IngestStats::default();
    let mut locations = BTreeSet::new();
    for input in &request.inputs {
        match resolve_gemini_input(input) {
            Ok(path) => {
                locations.insert(path);
            }
            Err(err) => {
                preflight.sources_scanned += 1;
                preflight.fail(&input.display().to_string(), None, &err);
            }
        }
    }
    if request.all_active {
        let selection = select_active_sources(db, Family::Gemini, request.auto_deactivate)?;
        preflight.sources_missing += selection.missing.len();
        preflight.sources_deactivated += selection.deactivated;
        locations.extend(
            selection
                .present
                .into_iter()
                .map(|source| PathBuf::from(source.location)),
        );
    }
    let mut stats = run_pipeline(db, &GEMINI, locations.into_iter().collect(), decider, options)?;
    stats.merge(preflight);
    Ok(stats)
}
