use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use usage_core::{Fingerprint, KeyPart, SessionRecord, TokenCounters};
use usage_db::Db;

use crate::fields::At;
use crate::pipeline::{IngestOptions, run_pipeline};
use crate::record::{Positioned, RawMeasurement, Record, Slot};
use crate::registry::Decider;
use crate::strategy::{Extractor, OPENCODE, ReadFrom, RecordStream, file_fingerprint};
use crate::types::{IngestError, IngestStats, Result};

const REQUIRED_TABLES: [&str; 3] = ["message", "session", "project"];
const PAGE_SIZE: i64 = 1000;

/// OpenCode's local SQLite store, read without taking write locks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCodeExtractor;

/// Identity for an export that carries none of its own.
pub fn identity_for_location(location: &Path) -> String {
    let canonical = fs::canonicalize(location).unwrap_or_else(|_| location.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|byte| format!("{byte:02x}")).collect();
    format!("opencode-{hex}")
}

fn export_error(location: &str, source: rusqlite::Error) -> IngestError {
    IngestError::Export {
        location: location.to_string(),
        source,
    }
}

fn open_read_only(location: &Path) -> Result<Connection> {
    let label = location.display().to_string();
    fs::metadata(location).map_err(|err| IngestError::io(&label, err))?;
    Connection::open_with_flags(
        location,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| export_error(&label, err))
}

fn ensure_schema(conn: &Connection, location: &str) -> Result<()> {
    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| export_error(location, err))?;
        if found.is_none() {
            missing.push(table);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::SourceSchema {
            location: location.to_string(),
            missing: missing.join(", "),
        })
    }
}

fn ensure_no_orphans(conn: &Connection, location: &str) -> Result<()> {
    let orphan: Option<String> = conn
        .query_row(
            r#"
            SELECT m.id
            FROM message m
            LEFT JOIN session s ON s.id = m.session_id
            LEFT JOIN project p ON p.id = s.project_id
            WHERE json_extract(m.data, '$.role') = 'assistant'
              AND (s.id IS NULL OR p.id IS NULL)
            ORDER BY m.time_updated ASC, m.id ASC
            LIMIT 1
            "#,
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| export_error(location, err))?;
    match orphan {
        Some(message_id) => Err(IngestError::OrphanRow {
            location: location.to_string(),
            message_id,
        }),
        None => Ok(()),
    }
}

impl Extractor for OpenCodeExtractor {
    fn read_identity(&self, location: &Path) -> Result<String> {
        let label = location.display().to_string();
        fs::metadata(location).map_err(|err| IngestError::io(&label, err))?;
        Ok(identity_for_location(location))
    }

    fn records<'a>(&'a self, location: &'a Path, from: &ReadFrom) -> Result<RecordStream<'a>> {
        let label = location.display().to_string();
        let conn = open_read_only(location)?;
        ensure_schema(&conn, &label)?;
        ensure_no_orphans(&conn, &label)?;
        let cursor = from.checkpoint.as_ref().and_then(|key| match &key.tiebreak {
            KeyPart::Text(id) => Some((key.ts.timestamp_millis(), id.clone())),
            KeyPart::Int(_) => None,
        });
        Ok(Box::new(MessagePages {
            conn,
            location: label,
            inclusive: cursor.is_some(),
            cursor,
            position: 0,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    /// The write-ahead log counts as part of the store.
    fn fingerprint(&self, location: &Path) -> Result<Fingerprint> {
        let mut fingerprint = file_fingerprint(location)?;
        let mut wal = location.as_os_str().to_owned();
        wal.push("-wal");
        if let Ok(sidecar) = file_fingerprint(Path::new(&wal)) {
            fingerprint.size_bytes += sidecar.size_bytes;
            fingerprint.mtime = fingerprint.mtime.max(sidecar.mtime);
        }
        Ok(fingerprint)
    }
}

struct MessageRow {
    message_id: String,
    session_id: String,
    time_created: i64,
    time_updated: i64,
    data: String,
    project_id: String,
    title: Option<String>,
    directory: Option<String>,
    version: Option<String>,
    worktree: Option<String>,
}

/// Keyset-paginated walk over assistant messages in `(time_updated, id)` order.
struct MessagePages {
    conn: Connection,
    location: String,
    cursor: Option<(i64, String)>,
    inclusive: bool,
    position: u64,
    buffer: VecDeque<Result<Positioned<Record>>>,
    done: bool,
}

impl MessagePages {
    fn fetch_page(&self) -> Result<Vec<MessageRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                r#"
                SELECT m.id, m.session_id, m.time_created, m.time_updated, m.data,
                       s.project_id, s.title, s.directory, s.version, p.worktree
                FROM message m
                JOIN session s ON s.id = m.session_id
                JOIN project p ON p.id = s.project_id
                WHERE json_extract(m.data, '$.role') = 'assistant'
                  AND (
                    ?1 IS NULL
                    OR m.time_updated > ?1
                    OR (m.time_updated = ?1 AND (m.id > ?2 OR (?3 AND m.id = ?2)))
                  )
                ORDER BY m.time_updated ASC, m.id ASC
                LIMIT ?4
                "#,
            )
            .map_err(|err| export_error(&self.location, err))?;
        let (after_ts, after_id) = match &self.cursor {
            Some((ts, id)) => (Some(*ts), Some(id.as_str())),
            None => (None, None),
        };
        let rows = stmt
            .query_map(
                params![after_ts, after_id, self.inclusive, PAGE_SIZE],
                |row| {
                    Ok(MessageRow {
                        message_id: row.get(0)?,
                        session_id: row.get(1)?,
                        time_created: row.get(2)?,
                        time_updated: row.get(3)?,
                        data: row.get(4)?,
                        project_id: row.get(5)?,
                        title: row.get(6)?,
                        directory: row.get(7)?,
                        version: row.get(8)?,
                        worktree: row.get(9)?,
                    })
                },
            )
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|err| export_error(&self.location, err))?;
        Ok(rows)
    }
}

impl Iterator for MessagePages {
    type Item = Result<Positioned<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(item);
        }
        if self.done {
            return None;
        }
        let rows = match self.fetch_page() {
            Ok(rows) => rows,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        if (rows.len() as i64) < PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = Some((last.time_updated, last.message_id.clone()));
            self.inclusive = false;
        }
        for row in rows {
            self.position += 1;
            let at = At::new(&self.location, self.position);
            let decoded = decode_row(row, at).map(|record| Positioned {
                position: at.position,
                end: None,
                record,
            });
            let failed = decoded.is_err();
            self.buffer.push_back(decoded);
            if failed {
                self.done = true;
                break;
            }
        }
        self.buffer.pop_front()
    }
}

fn millis(at: At<'_>, value: i64, field: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).ok_or_else(|| at.invalid(field, "epoch milliseconds"))
}

fn optional_text(at: At<'_>, data: &Value, key: &str) -> Result<Option<String>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(at.invalid(key, "a string or null")),
    }
}

fn decode_row(row: MessageRow, at: At<'_>) -> Result<Record> {
    let data: Value = serde_json::from_str(&row.data).map_err(|err| IngestError::MalformedJson {
        location: at.location.to_string(),
        position: at.position,
        message: format!("message {}: {err}", row.message_id),
    })?;
    let mut measurement = decode_data(&data, at)?;
    measurement.timestamp = millis(at, row.time_created, "time_created")?;
    measurement.order_ts = millis(at, row.time_updated, "time_updated")?;
    measurement.record_id = Some(row.message_id);
    measurement.session = Some(SessionRecord {
        session_id: row.session_id,
        started_at: None,
        directory: row.directory,
        title: row.title,
        project_id: Some(row.project_id),
        project_worktree: row.worktree,
        version: row.version,
    });
    Ok(Record::Measurement(measurement))
}

/// Usage and attribution from a message's `data` JSON. Timestamps and keys
/// come from the row itself and are filled in by the caller.
fn decode_data(data: &Value, at: At<'_>) -> Result<RawMeasurement> {
    if !data.is_object() {
        return Err(at.invalid("data", "a JSON object"));
    }
    let tokens = at.object(data, "tokens", "tokens")?;
    let cache = at.object(tokens, "cache", "tokens.cache")?;
    let usage = TokenCounters {
        input_tokens: at.count(tokens, "input", "tokens.input")?,
        cached_input_tokens: at.count(cache, "read", "tokens.cache.read")?,
        cache_write_tokens: at.count(cache, "write", "tokens.cache.write")?,
        output_tokens: at.count(tokens, "output", "tokens.output")?,
        reasoning_tokens: at.count(tokens, "reasoning", "tokens.reasoning")?,
        total_tokens: at.optional_count(tokens, "total", "tokens.total")?,
    };
    let cost_usd = match data.get("cost") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => number.as_f64(),
        Some(_) => return Err(at.invalid("cost", "a number or null")),
    };
    let completed_at = match data.get("time") {
        None | Some(Value::Null) => None,
        Some(time) if time.is_object() => at
            .optional_count(time, "completed", "time.completed")?
            .map(|ms| millis(at, ms as i64, "time.completed"))
            .transpose()?,
        Some(_) => return Err(at.invalid("time", "an object or null")),
    };
    let placeholder = DateTime::<Utc>::default();
    let mut measurement = RawMeasurement::new(placeholder, usage);
    measurement.inline.model = Slot::from_option(optional_text(at, data, "modelID")?);
    measurement.inline.provider = Slot::from_option(optional_text(at, data, "providerID")?);
    measurement.inline.agent = Slot::from_option(optional_text(at, data, "agent")?);
    measurement.inline.mode = Slot::from_option(optional_text(at, data, "mode")?);
    measurement.cost_usd = cost_usd;
    measurement.completed_at = completed_at;
    measurement.finish_reason = optional_text(at, data, "finish")?;
    Ok(measurement)
}

pub fn ingest_opencode(
    db: &mut Db,
    source_db: &Path,
    decider: &dyn Decider,
    options: &IngestOptions,
) -> Result<IngestStats> {
    run_pipeline(db, &OPENCODE, vec![source_db.to_path_buf()], decider, options)
}
