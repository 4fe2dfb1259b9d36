#![allow(dead_code)]

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use usage_core::{Family, KeyPart, OrderKey, TokenCounters, UsageContext, UsageEvent};
use usage_db::Db;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn counters(input: u64, output: u64) -> TokenCounters {
    TokenCounters {
        input_tokens: input,
        output_tokens: output,
        total_tokens: Some(input + output),
        ..TokenCounters::default()
    }
}

/// A Codex-shaped event keyed by its cumulative total.
pub fn codex_event(source_id: &str, at: &str, position: u64, cumulative: u64, step: u64) -> UsageEvent {
    UsageEvent {
        family: Family::Codex,
        source_id: source_id.to_string(),
        dedup_key: cumulative.to_string(),
        order: OrderKey {
            ts: ts(at),
            tiebreak: KeyPart::Int(cumulative as i64),
        },
        position,
        event_ts: ts(at),
        session_id: Some(source_id.to_string()),
        context: UsageContext {
            model: Some("gpt-5".to_string()),
            ..UsageContext::default()
        },
        usage: counters(step, 0),
        cumulative: Some(counters(cumulative, 0)),
        cost_usd: None,
        completed_at: None,
        finish_reason: None,
    }
}

/// An OpenCode-shaped event keyed by message id.
pub fn message_event(source_id: &str, id: &str, at: &str, output: u64) -> UsageEvent {
    UsageEvent {
        family: Family::OpenCode,
        source_id: source_id.to_string(),
        dedup_key: id.to_string(),
        order: OrderKey {
            ts: ts(at),
            tiebreak: KeyPart::Text(id.to_string()),
        },
        position: 1,
        event_ts: ts(at),
        session_id: None,
        context: UsageContext::default(),
        usage: counters(10, output),
        cumulative: None,
        cost_usd: Some(0.5),
        completed_at: None,
        finish_reason: Some("stop".to_string()),
    }
}
