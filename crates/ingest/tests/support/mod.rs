#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ingest::IngestOptions;
use tempfile::TempDir;
use usage_db::Db;

pub const SESSION_A: &str = "6f1f7a5e-0a43-4d5c-9f55-1f0b5a2e8c11";
pub const SESSION_B: &str = "0d9b7c3e-2f6a-4a77-b1a3-3c2e5d7f9a10";
pub const PROJECT: &str = "3b241101-e2bb-4255-8caf-4136c566a962";

pub struct TestEnv {
    pub dir: TempDir,
    pub db: Db,
}

impl TestEnv {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.path("sessions")
    }
}

pub fn setup() -> TestEnv {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut db = Db::open(dir.path().join("usage.sqlite")).expect("open db");
    db.migrate().expect("migrate db");
    TestEnv { dir, db }
}

pub fn options() -> IngestOptions {
    IngestOptions {
        workers: 2,
        ..IngestOptions::default()
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, contents).expect("write file");
}

pub fn append_line(path: &Path, line: &str) {
    let mut contents = fs::read_to_string(path).expect("read file");
    contents.push_str(line);
    contents.push('\n');
    fs::write(path, contents).expect("rewrite file");
}

pub fn ts(second: u32) -> String {
    format!("2025-01-01T00:00:{second:02}Z")
}

pub fn codex_meta(session_id: &str) -> String {
    format!(
        r#"{{"timestamp":"{}","type":"session_meta","payload":{{"id":"{session_id}","cwd":"/work/project"}}}}"#,
        ts(0)
    )
}

pub fn codex_model(model: &str) -> String {
    format!(r#"{{"type":"turn_context","payload":{{"model":"{model}","turn_id":null}}}}"#)
}

fn usage_json(input: u64, output: u64) -> String {
    format!(
        r#"{{"input_tokens":{input},"cached_input_tokens":0,"output_tokens":{output},"reasoning_output_tokens":0,"total_tokens":{}}}"#,
        input + output
    )
}

/// A `token_count` line whose counters all live in `input_tokens`.
pub fn codex_tokens(second: u32, cumulative: u64, last: u64) -> String {
    codex_split(second, (cumulative, 0), (last, 0))
}

/// A `token_count` line with explicit `(input, output)` splits.
pub fn codex_split(second: u32, cumulative: (u64, u64), last: (u64, u64)) -> String {
    format!(
        r#"{{"timestamp":"{}","type":"event_msg","payload":{{"type":"token_count","info":{{"total_token_usage":{},"last_token_usage":{}}}}}}}"#,
        ts(second),
        usage_json(cumulative.0, cumulative.1),
        usage_json(last.0, last.1)
    )
}

pub fn lines(lines: &[String]) -> String {
    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

/// A consistent session log reporting the given cumulative totals, one per
/// second. A repeated total repeats the previous line's payload.
pub fn codex_log(session_id: &str, totals: &[u64]) -> String {
    let mut lines = vec![codex_meta(session_id), codex_model("gpt-5")];
    let mut base = 0;
    let mut previous = 0;
    for (index, total) in totals.iter().copied().enumerate() {
        if total != previous {
            base = previous;
            previous = total;
        }
        lines.push(codex_tokens(index as u32 + 1, total, total.saturating_sub(base)));
    }
    let mut log = lines.join("\n");
    log.push('\n');
    log
}

pub fn gemini_meta(project_id: &str) -> String {
    format!(
        r#"{{"record_type":"gemini_cli.project_metadata","schema_version":1,"project_id":"{project_id}"}}"#
    )
}

pub fn gemini_response(second: u32, model: &str, input: u64, output: u64) -> String {
    format!(
        r#"{{"attributes":{{"event.name":"gemini_cli.api_response","event.timestamp":"{}","model":"{model}","input_token_count":{input},"cached_content_token_count":0,"output_token_count":{output},"thoughts_token_count":0,"total_token_count":{}}}}}"#,
        ts(second),
        input + output
    )
}
