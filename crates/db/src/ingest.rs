use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, ToSql, params};
use usage_core::{Family, Fingerprint, OrderKey, ReadCursor, SessionRecord, UsageEvent};

use crate::Db;
use crate::error::{DbError, Result};
use crate::helpers::{SOURCE_COLUMNS, format_ts, key_part_value, row_to_source};

/// Everything one input contributes, applied as a single transaction.
#[derive(Debug, Clone, Copy)]
pub struct InputCommit<'a> {
    pub family: Family,
    pub source_id: &'a str,
    pub sessions: &'a [SessionRecord],
    pub events: &'a [UsageEvent],
    pub fingerprint: Option<Fingerprint>,
    /// Replaces the stored read cursor; `None` clears it.
    pub read_cursor: Option<&'a ReadCursor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub sessions_upserted: usize,
}

struct EventRow {
    family: &'static str,
    source_id: String,
    dedup_key: String,
    order_ts: String,
    order_tiebreak: Value,
    position: i64,
    event_ts: String,
    session_id: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    agent: Option<String>,
    mode: Option<String>,
    turn_id: Option<String>,
    counters: [i64; 5],
    total_tokens: Option<i64>,
    cumulative: [Option<i64>; 6],
    cost_usd: Option<f64>,
    completed_at: Option<String>,
    finish_reason: Option<String>,
    ingested_at: String,
}

impl EventRow {
    fn new(event: &UsageEvent, ingested_at: &str) -> Self {
        let usage = &event.usage;
        let cumulative = match &event.cumulative {
            Some(cum) => [
                Some(cum.input_tokens as i64),
                Some(cum.cached_input_tokens as i64),
                Some(cum.cache_write_tokens as i64),
                Some(cum.output_tokens as i64),
                Some(cum.reasoning_tokens as i64),
                cum.total_tokens.map(|value| value as i64),
            ],
            None => [None; 6],
        };
        Self {
            family: event.family.as_str(),
            source_id: event.source_id.clone(),
            dedup_key: event.dedup_key.clone(),
            order_ts: format_ts(&event.order.ts),
            order_tiebreak: key_part_value(&event.order.tiebreak),
            position: event.position as i64,
            event_ts: format_ts(&event.event_ts),
            session_id: event.session_id.clone(),
            model: event.context.model.clone(),
            provider: event.context.provider.clone(),
            agent: event.context.agent.clone(),
            mode: event.context.mode.clone(),
            turn_id: event.context.turn_id.clone(),
            counters: [
                usage.input_tokens as i64,
                usage.cached_input_tokens as i64,
                usage.cache_write_tokens as i64,
                usage.output_tokens as i64,
                usage.reasoning_tokens as i64,
            ],
            total_tokens: usage.total_tokens.map(|value| value as i64),
            cumulative,
            cost_usd: event.cost_usd,
            completed_at: event.completed_at.as_ref().map(format_ts),
            finish_reason: event.finish_reason.clone(),
            ingested_at: ingested_at.to_string(),
        }
    }

    fn params(&self) -> [&dyn ToSql; 29] {
        [
            &self.family,
            &self.source_id,
            &self.dedup_key,
            &self.order_ts,
            &self.order_tiebreak,
            &self.position,
            &self.event_ts,
            &self.session_id,
            &self.model,
            &self.provider,
            &self.agent,
            &self.mode,
            &self.turn_id,
            &self.counters[0],
            &self.counters[1],
            &self.counters[2],
            &self.counters[3],
            &self.counters[4],
            &self.total_tokens,
            &self.cumulative[0],
            &self.cumulative[1],
            &self.cumulative[2],
            &self.cumulative[3],
            &self.cumulative[4],
            &self.cumulative[5],
            &self.cost_usd,
            &self.completed_at,
            &self.finish_reason,
            &self.ingested_at,
        ]
    }
}

const INSERT_EVENT: &str = r#"
    INSERT OR IGNORE INTO usage_event (
      family, source_id, dedup_key, order_ts, order_tiebreak, position, event_ts,
      session_id, model, provider, agent, mode, turn_id,
      input_tokens, cached_input_tokens, cache_write_tokens, output_tokens,
      reasoning_tokens, total_tokens,
      cum_input_tokens, cum_cached_input_tokens, cum_cache_write_tokens,
      cum_output_tokens, cum_reasoning_tokens, cum_total_tokens,
      cost_usd, completed_at, finish_reason, ingested_at
    ) VALUES (
      ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
    )
"#;

// Only rewrites rows whose stored values differ, so unchanged re-runs are
// reported as zero changes and keep their original `ingested_at`.
const UPDATE_EVENT: &str = r#"
    UPDATE usage_event SET
      order_ts = ?4, order_tiebreak = ?5, position = ?6, event_ts = ?7,
      session_id = ?8, model = ?9, provider = ?10, agent = ?11, mode = ?12,
      turn_id = ?13, input_tokens = ?14, cached_input_tokens = ?15,
      cache_write_tokens = ?16, output_tokens = ?17, reasoning_tokens = ?18,
      total_tokens = ?19, cum_input_tokens = ?20, cum_cached_input_tokens = ?21,
      cum_cache_write_tokens = ?22, cum_output_tokens = ?23,
      cum_reasoning_tokens = ?24, cum_total_tokens = ?25, cost_usd = ?26,
      completed_at = ?27, finish_reason = ?28, ingested_at = ?29
    WHERE family = ?1 AND source_id = ?2 AND dedup_key = ?3
      AND (
        order_ts IS NOT ?4 OR order_tiebreak IS NOT ?5 OR position IS NOT ?6
        OR event_ts IS NOT ?7 OR session_id IS NOT ?8 OR model IS NOT ?9
        OR provider IS NOT ?10 OR agent IS NOT ?11 OR mode IS NOT ?12
        OR turn_id IS NOT ?13 OR input_tokens IS NOT ?14
        OR cached_input_tokens IS NOT ?15 OR cache_write_tokens IS NOT ?16
        OR output_tokens IS NOT ?17 OR reasoning_tokens IS NOT ?18
        OR total_tokens IS NOT ?19 OR cum_input_tokens IS NOT ?20
        OR cum_cached_input_tokens IS NOT ?21 OR cum_cache_write_tokens IS NOT ?22
        OR cum_output_tokens IS NOT ?23 OR cum_reasoning_tokens IS NOT ?24
        OR cum_total_tokens IS NOT ?25 OR cost_usd IS NOT ?26
        OR completed_at IS NOT ?27 OR finish_reason IS NOT ?28
      )
"#;

impl Db {
    /// Upserts sessions and events and advances the source bookkeeping;
    /// all of it commits together or not at all.
    pub fn commit_input(&mut self, input: InputCommit<'_>) -> Result<CommitOutcome> {
        let now = Utc::now().to_rfc3339();
        let mut outcome = CommitOutcome::default();
        let tx = self.conn.transaction()?;
        let source = tx
            .query_row(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM ingest_source WHERE family = ?1 AND identity = ?2"
                ),
                params![input.family.as_str(), input.source_id],
                row_to_source,
            )
            .optional()?
            .ok_or(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO usage_session (
                  family, session_id, source_id, started_at, directory, title,
                  project_id, project_worktree, version, first_seen_at, last_seen_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                ON CONFLICT (family, session_id) DO UPDATE SET
                  source_id = excluded.source_id,
                  started_at = excluded.started_at,
                  directory = excluded.directory,
                  title = excluded.title,
                  project_id = excluded.project_id,
                  project_worktree = excluded.project_worktree,
                  version = excluded.version,
                  last_seen_at = excluded.last_seen_at
                "#,
            )?;
            for session in input.sessions {
                stmt.execute(params![
                    input.family.as_str(),
                    session.session_id,
                    input.source_id,
                    session.started_at.as_ref().map(format_ts),
                    session.directory,
                    session.title,
                    session.project_id,
                    session.project_worktree,
                    session.version,
                    now,
                ])?;
                outcome.sessions_upserted += 1;
            }
        }
        {
            let mut insert = tx.prepare(INSERT_EVENT)?;
            let mut update = tx.prepare(UPDATE_EVENT)?;
            for event in input.events {
                let row = EventRow::new(event, &now);
                let params = row.params();
                if insert.execute(&params[..])? > 0 {
                    outcome.inserted += 1;
                } else if update.execute(&params[..])? > 0 {
                    outcome.updated += 1;
                } else {
                    outcome.unchanged += 1;
                }
            }
        }
        let batch_max = input.events.iter().map(|event| &event.order).max();
        let cursor: Option<&OrderKey> = match (source.cursor.as_ref(), batch_max) {
            (Some(existing), Some(candidate)) => Some(existing.max(candidate)),
            (existing, candidate) => existing.or(candidate),
        };
        let fingerprint = input.fingerprint.or(source.fingerprint);
        let read = input.read_cursor;
        tx.execute(
            r#"
            UPDATE ingest_source
            SET file_size_bytes = ?3, file_mtime = ?4, cursor_ts = ?5,
                cursor_tiebreak = ?6, updated_at = ?7,
                read_offset = ?8, read_line = ?9, read_inode = ?10,
                read_session_id = ?11, read_model = ?12, read_provider = ?13,
                read_agent = ?14, read_mode = ?15, read_turn_id = ?16
            WHERE family = ?1 AND identity = ?2
            "#,
            params![
                input.family.as_str(),
                input.source_id,
                fingerprint.map(|value| value.size_bytes as i64),
                fingerprint.map(|value| format_ts(&value.mtime)),
                cursor.map(|value| format_ts(&value.ts)),
                cursor.map(|value| key_part_value(&value.tiebreak)),
                now,
                read.map(|value| value.byte_offset as i64),
                read.map(|value| value.line as i64),
                read.and_then(|value| value.inode).map(|inode| inode as i64),
                read.and_then(|value| value.session_id.as_deref()),
                read.and_then(|value| value.context.model.as_deref()),
                read.and_then(|value| value.context.provider.as_deref()),
                read.and_then(|value| value.context.agent.as_deref()),
                read.and_then(|value| value.context.mode.as_deref()),
                read.and_then(|value| value.context.turn_id.as_deref()),
            ],
        )?;
        tx.commit()?;
        Ok(outcome)
    }
}
