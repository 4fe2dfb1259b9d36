use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::{Type, Value, ValueRef};
use usage_core::{
    Family, Fingerprint, KeyPart, OrderKey, ReadCursor, SourceRow, TokenCounters, UsageContext,
    UsageEvent,
};

pub(crate) const SOURCE_COLUMNS: &str = r#"
    family, identity, location, active, file_size_bytes, file_mtime,
    cursor_ts, cursor_tiebreak, created_at, updated_at,
    read_offset, read_line, read_inode, read_session_id,
    read_model, read_provider, read_agent, read_mode, read_turn_id
"#;

pub(crate) const EVENT_COLUMNS: &str = r#"
    family, source_id, dedup_key, order_ts, order_tiebreak, position, event_ts,
    session_id, model, provider, agent, mode, turn_id,
    input_tokens, cached_input_tokens, cache_write_tokens, output_tokens,
    reasoning_tokens, total_tokens,
    cum_input_tokens, cum_cached_input_tokens, cum_cache_write_tokens,
    cum_output_tokens, cum_reasoning_tokens, cum_total_tokens,
    cost_usd, completed_at, finish_reason
"#;

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn key_part_value(part: &KeyPart) -> Value {
    match part {
        KeyPart::Int(value) => Value::Integer(*value),
        KeyPart::Text(value) => Value::Text(value.clone()),
    }
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row<'_>, idx: usize) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn get_opt_ts(
    row: &Row<'_>,
    idx: usize,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn get_key_part(row: &Row<'_>, idx: usize) -> std::result::Result<Option<KeyPart>, rusqlite::Error> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(value) => Ok(Some(KeyPart::Int(value))),
        ValueRef::Text(bytes) => Ok(Some(KeyPart::Text(
            String::from_utf8_lossy(bytes).into_owned(),
        ))),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "order_tiebreak".to_string(),
            other.data_type(),
        )),
    }
}

fn get_family(row: &Row<'_>, idx: usize) -> std::result::Result<Family, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    Family::parse(&raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(idx, format!("family '{raw}'"), Type::Text)
    })
}

fn get_u64(row: &Row<'_>, idx: usize) -> std::result::Result<u64, rusqlite::Error> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn get_opt_u64(row: &Row<'_>, idx: usize) -> std::result::Result<Option<u64>, rusqlite::Error> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|value| value as u64))
}

pub(crate) fn row_to_source(row: &Row<'_>) -> std::result::Result<SourceRow, rusqlite::Error> {
    let size: Option<i64> = row.get(4)?;
    let mtime = get_opt_ts(row, 5)?;
    let fingerprint = match (size, mtime) {
        (Some(size), Some(mtime)) => Some(Fingerprint {
            size_bytes: size as u64,
            mtime,
        }),
        _ => None,
    };
    let cursor_ts = get_opt_ts(row, 6)?;
    let cursor_tiebreak = get_key_part(row, 7)?;
    let cursor = match (cursor_ts, cursor_tiebreak) {
        (Some(ts), Some(tiebreak)) => Some(OrderKey { ts, tiebreak }),
        _ => None,
    };
    let read_cursor = match (get_opt_u64(row, 10)?, get_opt_u64(row, 11)?) {
        (Some(byte_offset), Some(line)) => Some(ReadCursor {
            byte_offset,
            line,
            inode: get_opt_u64(row, 12)?,
            session_id: row.get(13)?,
            context: UsageContext {
                model: row.get(14)?,
                provider: row.get(15)?,
                agent: row.get(16)?,
                mode: row.get(17)?,
                turn_id: row.get(18)?,
            },
        }),
        _ => None,
    };
    Ok(SourceRow {
        family: get_family(row, 0)?,
        identity: row.get(1)?,
        location: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        fingerprint,
        cursor,
        read_cursor,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub(crate) fn row_to_order_key(row: &Row<'_>) -> std::result::Result<OrderKey, rusqlite::Error> {
    let ts = get_ts(row, 0)?;
    let tiebreak = get_key_part(row, 1)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, "order_tiebreak".to_string(), Type::Null)
    })?;
    Ok(OrderKey { ts, tiebreak })
}

pub(crate) fn row_to_usage_event(
    row: &Row<'_>,
) -> std::result::Result<UsageEvent, rusqlite::Error> {
    let order_ts = get_ts(row, 3)?;
    let tiebreak = get_key_part(row, 4)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "order_tiebreak".to_string(), Type::Null)
    })?;
    let cum_total = get_opt_u64(row, 24)?;
    let cumulative = match get_opt_u64(row, 19)? {
        Some(input_tokens) => Some(TokenCounters {
            input_tokens,
            cached_input_tokens: get_opt_u64(row, 20)?.unwrap_or(0),
            cache_write_tokens: get_opt_u64(row, 21)?.unwrap_or(0),
            output_tokens: get_opt_u64(row, 22)?.unwrap_or(0),
            reasoning_tokens: get_opt_u64(row, 23)?.unwrap_or(0),
            total_tokens: cum_total,
        }),
        None => None,
    };
    Ok(UsageEvent {
        family: get_family(row, 0)?,
        source_id: row.get(1)?,
        dedup_key: row.get(2)?,
        order: OrderKey {
            ts: order_ts,
            tiebreak,
        },
        position: get_u64(row, 5)?,
        event_ts: get_ts(row, 6)?,
        session_id: row.get(7)?,
        context: UsageContext {
            model: row.get(8)?,
            provider: row.get(9)?,
            agent: row.get(10)?,
            mode: row.get(11)?,
            turn_id: row.get(12)?,
        },
        usage: TokenCounters {
            input_tokens: get_u64(row, 13)?,
            cached_input_tokens: get_u64(row, 14)?,
            cache_write_tokens: get_u64(row, 15)?,
            output_tokens: get_u64(row, 16)?,
            reasoning_tokens: get_u64(row, 17)?,
            total_tokens: get_opt_u64(row, 18)?,
        },
        cumulative,
        cost_usd: row.get(25)?,
        completed_at: get_opt_ts(row, 26)?,
        finish_reason: row.get(27)?,
    })
}
