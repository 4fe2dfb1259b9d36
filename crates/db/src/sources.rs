use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use usage_core::{Family, SourceRow};

use crate::Db;
use crate::error::{DbError, Result};
use crate::helpers::{SOURCE_COLUMNS, row_to_source};

impl Db {
    pub fn get_source(&self, family: Family, identity: &str) -> Result<Option<SourceRow>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM ingest_source WHERE family = ?1 AND identity = ?2"
                ),
                params![family.as_str(), identity],
                row_to_source,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Source registered at `location`, preferring the active one.
    pub fn get_source_by_location(
        &self,
        family: Family,
        location: &str,
    ) -> Result<Option<SourceRow>> {
        self.conn
            .query_row(
                &format!(
                    r#"
                    SELECT {SOURCE_COLUMNS}
                    FROM ingest_source
                    WHERE family = ?1 AND location = ?2
                    ORDER BY active DESC, updated_at DESC
                    LIMIT 1
                    "#
                ),
                params![family.as_str(), location],
                row_to_source,
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn list_sources(&self, family: Option<Family>) -> Result<Vec<SourceRow>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
            FROM ingest_source
            WHERE ?1 IS NULL OR family = ?1
            ORDER BY family ASC, location ASC
            "#
        ))?;
        let rows = stmt
            .query_map(params![family.map(|value| value.as_str())], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_active_sources(&self, family: Family) -> Result<Vec<SourceRow>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
            FROM ingest_source
            WHERE family = ?1 AND active = 1
            ORDER BY location ASC
            "#
        ))?;
        let rows = stmt
            .query_map(params![family.as_str()], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_source(&self, family: Family, identity: &str, location: &str) -> Result<SourceRow> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO ingest_source (family, identity, location, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?4)
            "#,
            params![family.as_str(), identity, location, now],
        )?;
        self.get_source(family, identity)?
            .ok_or(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn set_source_active(&self, family: Family, identity: &str, active: bool) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE ingest_source
            SET active = ?3, updated_at = ?4
            WHERE family = ?1 AND identity = ?2
            "#,
            params![family.as_str(), identity, active as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_source_location(
        &self,
        family: Family,
        identity: &str,
        location: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE ingest_source
            SET location = ?3, updated_at = ?4
            WHERE family = ?1 AND identity = ?2
            "#,
            params![family.as_str(), identity, location, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Flips the given active sources to inactive in one transaction and
    /// returns how many rows changed.
    pub fn deactivate_sources(&mut self, family: Family, identities: &[String]) -> Result<usize> {
        if identities.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut changed = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE ingest_source
                SET active = 0, updated_at = ?3
                WHERE family = ?1 AND identity = ?2 AND active = 1
                "#,
            )?;
            for identity in identities {
                changed += stmt.execute(params![family.as_str(), identity, now])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}
