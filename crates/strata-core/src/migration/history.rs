//! The migration ledger, stored as a table inside the target store.
//!
//! Every attempt is recorded as its own row and rows are never deleted. A
//! partial unique index guarantees at most one successful row per version,
//! which is what makes concurrent runners safe: the loser's insert fails.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::definition::MigrationDefinition;
use super::error::MigrationError;
use crate::target::quote_ident;

/// Message stored on a record whose migration was rolled back.
pub const ROLLED_BACK_MESSAGE: &str = "Rolled back";

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Row id; zero for records not yet inserted.
    pub id: i64,
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    /// Down script captured at application time.
    pub rollback_script: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    /// A successful application of `definition`.
    pub fn success(definition: &MigrationDefinition, executed_at: DateTime<Utc>, elapsed_ms: u64) -> Self {
        Self {
            id: 0,
            version: definition.version.clone(),
            name: definition.name.clone(),
            checksum: definition.checksum.clone(),
            executed_at,
            execution_time_ms: elapsed_ms,
            success: true,
            error_message: None,
            rollback_script: definition.down_script.clone(),
            rolled_back_at: None,
        }
    }

    /// A failed attempt at applying `definition`.
    pub fn failure(
        definition: &MigrationDefinition,
        executed_at: DateTime<Utc>,
        elapsed_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error.into()),
            rollback_script: None,
            ..Self::success(definition, executed_at, elapsed_ms)
        }
    }

    /// Whether this record was later rolled back.
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back_at.is_some()
    }
}

/// Accessor for the ledger table.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    table: String,
}

impl MigrationHistory {
    /// Ledger stored in `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    /// Name of the ledger table.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn ident(&self) -> String {
        quote_ident(&self.table)
    }

    /// Create the ledger table and its unique index if missing.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), MigrationError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                rollback_script TEXT,
                rolled_back_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {index}
                ON {table}(version) WHERE success = 1;",
            table = self.ident(),
            index = quote_ident(&format!("{}_applied_version", self.table)),
        ))?;
        Ok(())
    }

    /// Insert a record and return its row id.
    ///
    /// A second successful record for the same version violates the unique
    /// index and is reported as [`MigrationError::AlreadyApplied`].
    pub fn record_attempt(&self, conn: &Connection, record: &MigrationRecord) -> Result<i64, MigrationError> {
        let sql = format!(
            "INSERT INTO {} (version, name, checksum, executed_at, execution_time_ms, success,
                             error_message, rollback_script, rolled_back_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            self.ident()
        );
        let result = conn.execute(
            &sql,
            params![
                record.version,
                record.name,
                record.checksum,
                format_time(&record.executed_at),
                record.execution_time_ms as i64,
                record.success,
                record.error_message,
                record.rollback_script,
                record.rolled_back_at.as_ref().map(format_time),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(MigrationError::AlreadyApplied {
                version: record.version.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the successful record of `version` as rolled back.
    ///
    /// The record stays in the ledger with `success` cleared, which releases
    /// the version for a later explicit re-application.
    pub fn mark_rolled_back(
        &self,
        conn: &Connection,
        version: &str,
        at: DateTime<Utc>,
    ) -> Result<(), MigrationError> {
        let sql = format!(
            "UPDATE {} SET success = 0, error_message = ?1, rolled_back_at = ?2
             WHERE version = ?3 AND success = 1",
            self.ident()
        );
        let updated = conn.execute(&sql, params![ROLLED_BACK_MESSAGE, format_time(&at), version])?;
        if updated == 0 {
            return Err(MigrationError::NotApplied {
                version: version.to_string(),
            });
        }
        Ok(())
    }

    /// Versions with a successful record.
    pub fn applied_versions(&self, conn: &Connection) -> Result<BTreeSet<String>, MigrationError> {
        self.query_versions(
            conn,
            &format!("SELECT version FROM {} WHERE success = 1", self.ident()),
        )
    }

    /// Versions rolled back and not applied again since.
    pub fn rolled_back_versions(&self, conn: &Connection) -> Result<BTreeSet<String>, MigrationError> {
        let table = self.ident();
        self.query_versions(
            conn,
            &format!(
                "SELECT DISTINCT version FROM {table}
                 WHERE rolled_back_at IS NOT NULL
                   AND version NOT IN (SELECT version FROM {table} WHERE success = 1)"
            ),
        )
    }

    /// Versions whose most recent attempt failed and was never rolled back.
    pub fn failed_versions(&self, conn: &Connection) -> Result<BTreeSet<String>, MigrationError> {
        let table = self.ident();
        self.query_versions(
            conn,
            &format!(
                "SELECT r.version FROM {table} r
                 WHERE r.id = (SELECT MAX(id) FROM {table} WHERE version = r.version)
                   AND r.success = 0 AND r.rolled_back_at IS NULL"
            ),
        )
    }

    fn query_versions(&self, conn: &Connection, sql: &str) -> Result<BTreeSet<String>, MigrationError> {
        let mut stmt = conn.prepare(sql)?;
        let versions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(versions)
    }

    /// Every record, ordered by execution time then id.
    pub fn all_records(&self, conn: &Connection) -> Result<Vec<MigrationRecord>, MigrationError> {
        let sql = format!("{} ORDER BY executed_at, id", self.select());
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// The successful record of `version`, if any.
    pub fn latest_successful(
        &self,
        conn: &Connection,
        version: &str,
    ) -> Result<Option<MigrationRecord>, MigrationError> {
        let sql = format!("{} WHERE version = ?1 AND success = 1", self.select());
        Ok(conn.query_row(&sql, [version], record_from_row).optional()?)
    }

    /// Greatest applied version.
    pub fn current_version(&self, conn: &Connection) -> Result<Option<String>, MigrationError> {
        let sql = format!("SELECT MAX(version) FROM {} WHERE success = 1", self.ident());
        Ok(conn.query_row(&sql, [], |row| row.get::<_, Option<String>>(0))?)
    }

    fn select(&self) -> String {
        format!(
            "SELECT id, version, name, checksum, executed_at, execution_time_ms, success,
                    error_message, rollback_script, rolled_back_at
             FROM {}",
            self.ident()
        )
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationRecord> {
    Ok(MigrationRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        name: row.get(2)?,
        checksum: row.get(3)?,
        executed_at: parse_time(4, &row.get::<_, String>(4)?)?,
        execution_time_ms: row.get::<_, i64>(5)?.max(0) as u64,
        success: row.get(6)?,
        error_message: row.get(7)?,
        rollback_script: row.get(8)?,
        rolled_back_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| parse_time(9, &s))
            .transpose()?,
    })
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort correctly.
fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Whether an error is a uniqueness violation of the ledger index.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}
