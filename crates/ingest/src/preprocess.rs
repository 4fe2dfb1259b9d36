use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::{find_str, parse_timestamp};
use crate::reader::{ConcatenatedObjects, JsonLines};
use crate::types::{IngestError, Result};

pub const METADATA_RECORD_TYPE: &str = "gemini_cli.project_metadata";
pub const METADATA_SCHEMA_VERSION: u64 = 1;

const EVENT_TIMESTAMP: [&str; 2] = ["attributes", "event.timestamp"];

/// Line 1 of a normalized telemetry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub record_type: String,
    pub schema_version: u64,
    pub project_id: String,
}

impl ProjectMetadata {
    pub fn generate() -> Self {
        Self {
            record_type: METADATA_RECORD_TYPE.to_string(),
            schema_version: METADATA_SCHEMA_VERSION,
            project_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Validates a parsed first-line object; the error is a human-readable reason.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let record_type = value.get("record_type").and_then(Value::as_str);
        if record_type != Some(METADATA_RECORD_TYPE) {
            return Err(format!(
                "expected record_type {METADATA_RECORD_TYPE:?}, got {}",
                value.get("record_type").unwrap_or(&Value::Null)
            ));
        }
        let version = value.get("schema_version").and_then(Value::as_u64);
        if version != Some(METADATA_SCHEMA_VERSION) {
            return Err(format!(
                "expected schema_version {METADATA_SCHEMA_VERSION}, got {}",
                value.get("schema_version").unwrap_or(&Value::Null)
            ));
        }
        let raw = value
            .get("project_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "project_id must be a UUID string".to_string())?;
        let project_id = uuid::Uuid::parse_str(raw)
            .map_err(|_| format!("invalid project_id {raw:?}"))?
            .hyphenated()
            .to_string();
        Ok(Self {
            record_type: METADATA_RECORD_TYPE.to_string(),
            schema_version: METADATA_SCHEMA_VERSION,
            project_id,
        })
    }
}

fn read_first_line(path: &Path) -> Result<Option<String>> {
    let label = path.display().to_string();
    let file = File::open(path).map_err(|err| IngestError::io(&label, err))?;
    let mut line = String::new();
    let read = BufReader::new(file)
        .read_line(&mut line)
        .map_err(|err| IngestError::Read {
            location: label,
            position: 1,
            source: err,
        })?;
    Ok((read > 0).then_some(line))
}

fn first_object(line: &str, location: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err(IngestError::MalformedJson {
            location: location.to_string(),
            position: 1,
            message: "expected a JSON object".to_string(),
        }),
        Err(err) => Err(IngestError::MalformedJson {
            location: location.to_string(),
            position: 1,
            message: err.to_string(),
        }),
    }
}

/// Reads and validates the metadata line. Any problem with it means the file
/// has no usable identity.
pub fn read_project_metadata(path: &Path) -> Result<ProjectMetadata> {
    let label = path.display().to_string();
    let missing = || IngestError::MissingIdentity {
        location: label.clone(),
    };
    let Some(line) = read_first_line(path)? else {
        return Err(missing());
    };
    let value = first_object(&line, &label).map_err(|_| missing())?;
    ProjectMetadata::from_value(&value).map_err(|reason| {
        tracing::debug!(location = %label, reason = %reason, "invalid project metadata");
        missing()
    })
}

fn write_metadata_line(writer: &mut impl Write, metadata: &ProjectMetadata) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, metadata)?;
    writer.write_all(b"\n")
}

fn prepend_metadata(path: &Path, metadata: &ProjectMetadata) -> Result<()> {
    let label = path.display().to_string();
    let temp = path.with_extension("jsonl.tmp");
    if temp.exists() {
        return Err(IngestError::InvalidInput {
            location: label,
            message: format!(
                "temp file {} already exists; remove it and retry",
                temp.display()
            ),
        });
    }
    let result = (|| -> io::Result<()> {
        let mut out = BufWriter::new(File::create(&temp)?);
        write_metadata_line(&mut out, metadata)?;
        let mut original = File::open(path)?;
        io::copy(&mut original, &mut out)?;
        out.flush()?;
        drop(out);
        fs::rename(&temp, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&temp);
        return Err(IngestError::io(&label, err));
    }
    Ok(())
}

/// Guarantees line 1 of `path` is the project metadata record and returns the
/// project id. A file whose first record is an ordinary event gets a fresh
/// metadata line prepended; a malformed metadata line is an error.
pub fn ensure_metadata_line(path: &Path) -> Result<String> {
    let label = path.display().to_string();
    let first = read_first_line(path)?;
    if let Some(line) = first.as_deref().filter(|line| !line.trim().is_empty()) {
        let value = first_object(line, &label)?;
        if value.get("record_type").is_some() {
            return ProjectMetadata::from_value(&value)
                .map(|metadata| metadata.project_id)
                .map_err(|reason| IngestError::InvalidInput {
                    location: label,
                    message: format!("malformed project metadata: {reason}"),
                });
        }
    }
    let metadata = ProjectMetadata::generate();
    prepend_metadata(path, &metadata)?;
    tracing::info!(location = %label, project_id = %metadata.project_id, "added project metadata");
    Ok(metadata.project_id)
}

/// Newest `attributes."event.timestamp"` already present in a JSONL file.
pub fn last_timestamp(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let label = path.display().to_string();
    let file = File::open(path).map_err(|err| IngestError::io(&label, err))?;
    let mut newest = None;
    for item in JsonLines::new(BufReader::new(file), label.as_str()) {
        let value = item?.value;
        if let Some(ts) = find_str(&value, &EVENT_TIMESTAMP).and_then(parse_timestamp) {
            newest = newest.max(Some(ts));
        }
    }
    Ok(newest)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConvertStats {
    pub objects_read: usize,
    pub records_appended: usize,
    pub records_skipped: usize,
}

/// Appends timestamped objects from a concatenated-JSON telemetry log to
/// `jsonl`, keeping only those newer than what the JSONL already holds.
pub fn convert_log(log: &Path, jsonl: &Path) -> Result<ConvertStats> {
    let log_display = log.display().to_string();
    let jsonl_display = jsonl.display().to_string();
    let newest = if jsonl.exists() {
        ensure_metadata_line(jsonl)?;
        last_timestamp(jsonl)?
    } else {
        if let Some(parent) = jsonl.parent() {
            fs::create_dir_all(parent).map_err(|err| IngestError::io(&jsonl_display, err))?;
        }
        let mut file = File::create(jsonl).map_err(|err| IngestError::io(&jsonl_display, err))?;
        write_metadata_line(&mut file, &ProjectMetadata::generate())
            .map_err(|err| IngestError::io(&jsonl_display, err))?;
        None
    };

    let input = File::open(log).map_err(|err| IngestError::io(&log_display, err))?;
    let output = OpenOptions::new()
        .append(true)
        .open(jsonl)
        .map_err(|err| IngestError::io(&jsonl_display, err))?;
    let mut out = BufWriter::new(output);
    let mut stats = ConvertStats::default();
    for item in ConcatenatedObjects::new(BufReader::new(input), log_display.as_str()) {
        let (_, value) = item?;
        let Some(ts) = find_str(&value, &EVENT_TIMESTAMP).and_then(parse_timestamp) else {
            continue;
        };
        stats.objects_read += 1;
        if newest.is_some_and(|newest| ts <= newest) {
            stats.records_skipped += 1;
            continue;
        }
        serde_json::to_writer(&mut out, &value)
            .map_err(|err| IngestError::io(&jsonl_display, err.into()))?;
        out.write_all(b"\n")
            .map_err(|err| IngestError::io(&jsonl_display, err))?;
        stats.records_appended += 1;
    }
    out.flush()
        .map_err(|err| IngestError::io(&jsonl_display, err))?;
    tracing::info!(
        log = %log_display,
        jsonl = %jsonl_display,
        appended = stats.records_appended,
        skipped = stats.records_skipped,
        "converted telemetry log"
    );
    Ok(stats)
}

/// Raw log (if any) and normalized JSONL that a preprocess input maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessInput {
    pub log: Option<PathBuf>,
    pub jsonl: PathBuf,
}

pub fn resolve_preprocess_input(path: &Path) -> Result<PreprocessInput> {
    let label = path.display().to_string();
    if path.is_dir() {
        for base in [path.to_path_buf(), path.join(".gemini")] {
            let log = base.join("telemetry.log");
            if log.is_file() {
                return Ok(PreprocessInput {
                    jsonl: log.with_extension("jsonl"),
                    log: Some(log),
                });
            }
        }
        for base in [path.to_path_buf(), path.join(".gemini")] {
            let jsonl = base.join("telemetry.jsonl");
            if jsonl.is_file() {
                return Ok(PreprocessInput { log: None, jsonl });
            }
        }
        return Err(IngestError::InvalidInput {
            location: label,
            message: "no telemetry.log or telemetry.jsonl here or under .gemini".to_string(),
        });
    }
    if !path.is_file() {
        return Err(IngestError::InvalidInput {
            location: label,
            message: "input does not exist".to_string(),
        });
    }
    match path.extension().and_then(|value| value.to_str()) {
        Some("log") => Ok(PreprocessInput {
            log: Some(path.to_path_buf()),
            jsonl: path.with_extension("jsonl"),
        }),
        Some("jsonl") => {
            let sibling = path.with_file_name("telemetry.log");
            Ok(PreprocessInput {
                log: sibling.is_file().then_some(sibling),
                jsonl: path.to_path_buf(),
            })
        }
        _ => Err(IngestError::InvalidInput {
            location: label,
            message: "expected a directory, .log, or .jsonl path".to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessOutcome {
    pub jsonl: PathBuf,
    pub project_id: String,
    pub converted: Option<ConvertStats>,
}

/// Brings a Gemini input into the normalized JSONL shape the extractor reads.
pub fn preprocess(path: &Path) -> Result<PreprocessOutcome> {
    let input = resolve_preprocess_input(path)?;
    let converted = match &input.log {
        Some(log) => Some(convert_log(log, &input.jsonl)?),
        None => None,
    };
    let project_id = ensure_metadata_line(&input.jsonl)?;
    Ok(PreprocessOutcome {
        jsonl: input.jsonl,
        project_id,
        converted,
    })
}
