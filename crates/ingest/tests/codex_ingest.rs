mod support;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ingest::{AlwaysAllow, AlwaysDeny, AutoRegister, IngestOptions, ingest_codex_sessions};
use support::{
    SESSION_A, SESSION_B, append_line, codex_log, codex_meta, codex_model, codex_split,
    codex_tokens, lines, options, setup, write_file,
};
use usage_core::{Family, KeyPart};

#[test]
fn repeated_cumulative_totals_collapse_to_one_event() {
    let mut env = setup();
    let log = env.path("sessions/2025/01/01/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100, 250, 250, 400]));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.sources_scanned, 1);
    assert_eq!(stats.sources_ingested, 1);
    assert_eq!(stats.records_seen, 4);
    assert_eq!(stats.duplicates_collapsed, 1);
    assert_eq!(stats.records_inserted, 3);

    let events = env
        .db
        .usage_events_for_source(Family::Codex, SESSION_A)
        .expect("events");
    let increments: Vec<u64> = events.iter().map(|event| event.usage.input_tokens).collect();
    assert_eq!(increments, vec![100, 150, 150]);
    assert_eq!(events[2].order.tiebreak, KeyPart::Int(400));
    assert_eq!(events[0].context.model.as_deref(), Some("gpt-5"));
    assert_eq!(events[0].session_id.as_deref(), Some(SESSION_A));

    let session = env
        .db
        .get_session(Family::Codex, SESSION_A)
        .expect("session lookup")
        .expect("session");
    assert_eq!(session.directory.as_deref(), Some("/work/project"));
}

#[test]
fn unchanged_inputs_are_skipped_on_rerun() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100, 250, 400]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("second run");
    assert_eq!(stats.sources_skipped_unchanged, 1);
    assert_eq!(stats.records_seen, 0);
    assert_eq!(stats.records_inserted, 0);
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, Some(SESSION_A))
            .expect("count"),
        3
    );
}

#[test]
fn appended_lines_resume_after_the_checkpoint() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100, 250, 250, 400]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    append_line(&log, &codex_tokens(5, 600, 200));
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("second run");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.records_seen, 1);
    assert_eq!(stats.skipped_before_checkpoint, 0);
    assert_eq!(stats.duplicates_collapsed, 0);
    assert_eq!(stats.records_inserted, 1);

    let source = env
        .db
        .get_source(Family::Codex, SESSION_A)
        .expect("source lookup")
        .expect("source");
    let cursor = source.cursor.expect("cursor");
    assert_eq!(cursor.tiebreak, KeyPart::Int(600));
    let read = source.read_cursor.expect("read cursor");
    assert_eq!(read.line, 7);
    assert_eq!(read.byte_offset, fs::metadata(&log).expect("metadata").len());
    assert_eq!(read.session_id.as_deref(), Some(SESSION_A));
    assert_eq!(read.context.model.as_deref(), Some("gpt-5"));
}

#[test]
fn tail_reads_do_not_reparse_committed_lines() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let committed = [
        codex_meta(SESSION_A),
        codex_model("gpt-5"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 150),
    ];
    write_file(&log, &lines(&committed));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    // Same length, so the stored offset still lands on the line boundary.
    let corrupted = [
        committed[0].clone(),
        committed[1].clone(),
        "#".repeat(committed[2].len()),
        committed[3].clone(),
        codex_tokens(3, 400, 150),
    ];
    fs::write(&log, lines(&corrupted)).expect("rewrite in place");

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("second run");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.records_seen, 1);
    assert_eq!(stats.records_inserted, 1);
    let events = env
        .db
        .usage_events_for_source(Family::Codex, SESSION_A)
        .expect("events");
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].usage.input_tokens, 150);
    assert_eq!(events[2].context.model.as_deref(), Some("gpt-5"));
}

#[test]
fn files_replaced_below_the_read_offset_are_read_in_full() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100, 250, 400]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    write_file(&log, &codex_log(SESSION_A, &[100]));
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("second run");
    assert_eq!(stats.sources_failed, 1);
    assert!(
        stats.issues[0].message.contains("input was rewritten"),
        "{}",
        stats.issues[0].message
    );
}

#[test]
fn conflicting_payloads_roll_back_the_input() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let lines = [
        codex_meta(SESSION_A),
        codex_model("gpt-5"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 150),
        codex_split(3, (150, 100), (50, 100)),
    ];
    write_file(&log, &(lines.join("\n") + "\n"));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.sources_ingested, 0);
    assert!(
        stats.issues[0].message.contains("conflicting payloads"),
        "{}",
        stats.issues[0].message
    );
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, None)
            .expect("count"),
        0
    );
    let source = env
        .db
        .get_source(Family::Codex, SESSION_A)
        .expect("source lookup")
        .expect("registered");
    assert!(source.fingerprint.is_none());
    assert!(source.cursor.is_none());
}

#[test]
fn re_emitted_snapshots_keep_the_first_increment() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let stream = [
        codex_meta(SESSION_A),
        codex_model("m1"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 150),
        codex_tokens(3, 250, 0),
        codex_tokens(4, 400, 150),
    ];
    write_file(&log, &lines(&stream));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.duplicates_collapsed, 1);
    assert_eq!(stats.records_inserted, 3);

    let events = env
        .db
        .usage_events_for_source(Family::Codex, SESSION_A)
        .expect("events");
    let increments: Vec<u64> = events.iter().map(|event| event.usage.input_tokens).collect();
    assert_eq!(increments, vec![100, 150, 150]);
    assert!(
        events
            .iter()
            .all(|event| event.context.model.as_deref() == Some("m1"))
    );
}

#[test]
fn a_repeated_total_under_another_model_conflicts() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let stream = [
        codex_meta(SESSION_A),
        codex_model("m1"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 150),
        codex_model("m2"),
        codex_tokens(3, 250, 0),
    ];
    write_file(&log, &lines(&stream));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_failed, 1);
    assert!(
        stats.issues[0].message.contains("conflicting payloads"),
        "{}",
        stats.issues[0].message
    );
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, None)
            .expect("count"),
        0
    );
}

#[test]
fn decreasing_totals_fail_the_input() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let lines = [
        codex_meta(SESSION_A),
        codex_model("gpt-5"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 150),
        codex_tokens(3, 200, 50),
    ];
    write_file(&log, &(lines.join("\n") + "\n"));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_failed, 1);
    assert!(
        stats.issues[0].message.contains("does not exceed"),
        "{}",
        stats.issues[0].message
    );
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, None)
            .expect("count"),
        0
    );
}

#[test]
fn increments_must_match_cumulative_deltas() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    let lines = [
        codex_meta(SESSION_A),
        codex_model("gpt-5"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 250, 100),
    ];
    write_file(&log, &(lines.join("\n") + "\n"));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_failed, 1);
    assert!(
        stats.issues[0].message.contains("advanced by 150"),
        "{}",
        stats.issues[0].message
    );
}

#[test]
fn a_failed_input_does_not_block_the_others() {
    let mut env = setup();
    write_file(
        &env.path("sessions/rollout-a.jsonl"),
        &codex_log(SESSION_A, &[100, 250]),
    );
    let bad = [
        codex_meta(SESSION_B),
        codex_tokens(1, 100, 100),
    ];
    write_file(&env.path("sessions/rollout-b.jsonl"), &(bad.join("\n") + "\n"));

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_scanned, 2);
    assert_eq!(stats.sources_ingested, 1);
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(
        stats.issues[0].identity.as_deref(),
        Some(SESSION_B),
        "{:?}",
        stats.issues
    );
    assert!(stats.issues[0].message.contains("no model"));
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, Some(SESSION_A))
            .expect("count"),
        2
    );
}

#[test]
fn one_identity_at_two_locations_fails_both() {
    let mut env = setup();
    let log = codex_log(SESSION_A, &[100]);
    write_file(&env.path("sessions/a/rollout.jsonl"), &log);
    write_file(&env.path("sessions/b/rollout.jsonl"), &log);

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_failed, 2);
    assert!(
        stats
            .issues
            .iter()
            .all(|issue| issue.message.contains("multiple locations"))
    );
    assert!(
        env.db
            .get_source(Family::Codex, SESSION_A)
            .expect("lookup")
            .is_none()
    );
}

#[test]
fn moved_logs_keep_their_history() {
    let mut env = setup();
    let original = env.path("sessions/2025/01/01/rollout-a.jsonl");
    write_file(&original, &codex_log(SESSION_A, &[100, 250]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    let moved = env.path("sessions/archive/rollout-a.jsonl");
    fs::create_dir_all(moved.parent().expect("parent")).expect("mkdir");
    fs::rename(&original, &moved).expect("rename");

    let sessions_root = env.sessions_root();
    let declined = ingest_codex_sessions(
        &mut env.db,
        &sessions_root,
        &AutoRegister(AlwaysDeny),
        &options(),
    )
    .expect("declined run");
    assert_eq!(declined.sources_failed, 1);
    assert!(declined.issues[0].message.contains("declined"));

    append_line(&moved, &codex_tokens(3, 400, 150));
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("relocating run");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.records_inserted, 1);
    let source = env
        .db
        .get_source(Family::Codex, SESSION_A)
        .expect("lookup")
        .expect("source");
    let canonical = fs::canonicalize(&moved).expect("canonical");
    assert_eq!(source.location, canonical.display().to_string());
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, Some(SESSION_A))
            .expect("count"),
        3
    );
}

#[test]
fn declined_reactivation_fails_only_that_input() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");
    env.db
        .set_source_active(Family::Codex, SESSION_A, false)
        .expect("deactivate");
    write_file(
        &env.path("sessions/rollout-b.jsonl"),
        &codex_log(SESSION_B, &[50]),
    );

    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(
        &mut env.db,
        &sessions_root,
        &AutoRegister(AlwaysDeny),
        &options(),
    )
    .expect("ingest");
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.issues[0].identity.as_deref(), Some(SESSION_A));
    assert_eq!(stats.sources_ingested, 1);
    let source = env
        .db
        .get_source(Family::Codex, SESSION_A)
        .expect("lookup")
        .expect("source");
    assert!(!source.active);
}

#[test]
fn full_refresh_reprocesses_unchanged_inputs() {
    let mut env = setup();
    write_file(
        &env.path("sessions/rollout-a.jsonl"),
        &codex_log(SESSION_A, &[100, 250, 400]),
    );
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");

    let refresh = IngestOptions {
        full_refresh: true,
        ..options()
    };
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &refresh)
        .expect("refresh");
    assert!(!stats.has_failures(), "{:?}", stats.issues);
    assert_eq!(stats.sources_skipped_unchanged, 0);
    assert_eq!(stats.skipped_before_checkpoint, 0);
    assert_eq!(stats.records_seen, 3);
    assert_eq!(stats.records_inserted, 0);
    assert_eq!(stats.records_unchanged, 3);
}

#[test]
fn full_refresh_rejects_history_that_no_longer_adds_up() {
    let mut env = setup();
    let log = env.path("sessions/rollout-a.jsonl");
    write_file(&log, &codex_log(SESSION_A, &[100, 250, 400]));
    let sessions_root = env.sessions_root();
    ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("first run");
    let before = env
        .db
        .usage_events_for_source(Family::Codex, SESSION_A)
        .expect("events before");

    let rewritten = [
        codex_meta(SESSION_A),
        codex_model("gpt-5"),
        codex_tokens(1, 100, 100),
        codex_tokens(2, 300, 200),
    ];
    write_file(&log, &lines(&rewritten));
    let refresh = IngestOptions {
        full_refresh: true,
        ..options()
    };
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &refresh)
        .expect("refresh");
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.records_inserted, 0);
    assert!(
        stats.issues[0].message.contains("advanced by 50"),
        "{}",
        stats.issues[0].message
    );

    let after = env
        .db
        .usage_events_for_source(Family::Codex, SESSION_A)
        .expect("events after");
    assert_eq!(after, before);
    assert!(after.iter().any(|event| event.dedup_key == "250"));
    assert!(after.iter().all(|event| event.dedup_key != "300"));
}

#[test]
fn cancellation_stops_before_any_commit() {
    let mut env = setup();
    write_file(
        &env.path("sessions/rollout-a.jsonl"),
        &codex_log(SESSION_A, &[100]),
    );
    let cancelled = IngestOptions {
        cancel: Some(Arc::new(AtomicBool::new(true))),
        ..options()
    };
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &cancelled)
        .expect("ingest");
    assert!(stats.cancelled);
    assert_eq!(stats.sources_ingested, 0);
    assert_eq!(
        env.db
            .count_usage_events(Family::Codex, None)
            .expect("count"),
        0
    );
}

#[test]
fn missing_sessions_root_is_empty() {
    let mut env = setup();
    let sessions_root = env.sessions_root();
    let stats = ingest_codex_sessions(&mut env.db, &sessions_root, &AlwaysAllow, &options())
        .expect("ingest");
    assert_eq!(stats.sources_scanned, 0);
    assert!(!stats.has_failures());
}
