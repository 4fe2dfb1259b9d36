use rusqlite::{OptionalExtension, params};
use usage_core::{Family, OrderKey, SessionRecord, UsageEvent};

use crate::Db;
use crate::error::{DbError, Result};
use crate::helpers::{EVENT_COLUMNS, format_ts, key_part_value, row_to_order_key, row_to_usage_event};

impl Db {
    /// Highest ordering key committed for a logical stream.
    pub fn stream_checkpoint(&self, family: Family, source_id: &str) -> Result<Option<OrderKey>> {
        self.conn
            .query_row(
                r#"
                SELECT order_ts, order_tiebreak
                FROM usage_event
                WHERE family = ?1 AND source_id = ?2
                ORDER BY order_ts DESC, order_tiebreak DESC
                LIMIT 1
                "#,
                params![family.as_str(), source_id],
                row_to_order_key,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Committed events at or after `from`, in stream order.
    pub fn usage_events_from(
        &self,
        family: Family,
        source_id: &str,
        from: &OrderKey,
    ) -> Result<Vec<UsageEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM usage_event
            WHERE family = ?1 AND source_id = ?2
              AND (order_ts > ?3 OR (order_ts = ?3 AND order_tiebreak >= ?4))
            ORDER BY order_ts ASC, order_tiebreak ASC
            "#
        ))?;
        let rows = stmt
            .query_map(
                params![
                    family.as_str(),
                    source_id,
                    format_ts(&from.ts),
                    key_part_value(&from.tiebreak)
                ],
                row_to_usage_event,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn usage_events_for_source(
        &self,
        family: Family,
        source_id: &str,
    ) -> Result<Vec<UsageEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM usage_event
            WHERE family = ?1 AND source_id = ?2
            ORDER BY order_ts ASC, order_tiebreak ASC
            "#
        ))?;
        let rows = stmt
            .query_map(params![family.as_str(), source_id], row_to_usage_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_usage_events(&self, family: Family, source_id: Option<&str>) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM usage_event
            WHERE family = ?1 AND (?2 IS NULL OR source_id = ?2)
            "#,
            params![family.as_str(), source_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_session(&self, family: Family, session_id: &str) -> Result<Option<SessionRecord>> {
        self.conn
            .query_row(
                r#"
                SELECT session_id, started_at, directory, title, project_id,
                       project_worktree, version
                FROM usage_session
                WHERE family = ?1 AND session_id = ?2
                "#,
                params![family.as_str(), session_id],
                |row| {
                    let started_at: Option<String> = row.get(1)?;
                    Ok((
                        SessionRecord {
                            session_id: row.get(0)?,
                            started_at: None,
                            directory: row.get(2)?,
                            title: row.get(3)?,
                            project_id: row.get(4)?,
                            project_worktree: row.get(5)?,
                            version: row.get(6)?,
                        },
                        started_at,
                    ))
                },
            )
            .optional()?
            .map(|(mut session, started_at)| {
                session.started_at = started_at
                    .map(|raw| chrono::DateTime::parse_from_rfc3339(&raw))
                    .transpose()?
                    .map(|parsed| parsed.with_timezone(&chrono::Utc));
                Ok(session)
            })
            .transpose()
    }
}
