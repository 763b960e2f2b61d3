//! Restoring artifacts into the target store.
//!
//! Tables are restored one at a time, each inside its own transaction. A
//! failure rolls back only the table being restored; tables restored before
//! it stay restored and are reported in [`BackupError::PartialRestore`].

use std::collections::BTreeSet;
use std::io::BufRead;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::artifact::{DumpLine, DumpReader};
use super::error::BackupError;
use super::metadata::BackupMetadata;
use crate::error::Error;
use crate::target::{quote_ident, table_exists, TargetStore};

/// Scope of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreType {
    /// Structure and data of every table in the artifact
    Full,
    /// Structure only; tables are recreated empty
    SchemaOnly,
    /// Rows only; existing rows are replaced
    DataOnly,
    /// Structure and data of the selected tables
    Selective,
}

impl RestoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreType::Full => "full",
            RestoreType::SchemaOnly => "schema_only",
            RestoreType::DataOnly => "data_only",
            RestoreType::Selective => "selective",
        }
    }
}

impl std::fmt::Display for RestoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RestoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RestoreType::Full,
            RestoreType::SchemaOnly,
            RestoreType::DataOnly,
            RestoreType::Selective,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown restore type: {}", s))
    }
}

/// A request to restore a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub restore_type: RestoreType,
    /// Tables to restore for [`RestoreType::Selective`]
    #[serde(default)]
    pub selected_tables: Vec<String>,
    /// Recompute the artifact checksum before touching the store
    pub validate_before_restore: bool,
    /// Take a full backup of the current state first
    pub create_safety_backup: bool,
}

impl RestoreRequest {
    /// A validated restore preceded by a safety backup.
    pub fn new(backup_id: impl Into<String>, restore_type: RestoreType) -> Self {
        Self {
            backup_id: backup_id.into(),
            restore_type,
            selected_tables: Vec::new(),
            validate_before_restore: true,
            create_safety_backup: true,
        }
    }

    /// A selective restore of the given tables.
    pub fn selective(backup_id: impl Into<String>, tables: Vec<String>) -> Self {
        Self {
            selected_tables: tables,
            ..Self::new(backup_id, RestoreType::Selective)
        }
    }

    /// Enable or disable checksum validation.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_before_restore = validate;
        self
    }

    /// Enable or disable the safety backup.
    pub fn with_safety_backup(mut self, safety: bool) -> Self {
        self.create_safety_backup = safety;
        self
    }
}

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restore_type: RestoreType,
    /// Tables restored, in artifact order
    pub restored_tables: Vec<String>,
    pub rows_restored: u64,
    /// Backup taken before the restore, if requested
    pub safety_backup_id: Option<String>,
    pub duration_ms: u64,
}

/// How each table of an artifact is applied.
#[derive(Debug, Clone)]
pub(crate) struct RestorePlan {
    restore_type: RestoreType,
    upsert: bool,
    tables: Option<BTreeSet<String>>,
    ledger: String,
}

impl RestorePlan {
    /// Check a request against the backup it names.
    ///
    /// `ledger` is the migration history table. It belongs to the migration
    /// runner and is never written by a restore.
    pub(crate) fn new(request: &RestoreRequest, metadata: &BackupMetadata, ledger: &str) -> Result<Self, BackupError> {
        let backup_type = metadata.backup_type;
        match request.restore_type {
            RestoreType::SchemaOnly if !backup_type.includes_structure() => {
                return Err(BackupError::InvalidRequest(format!(
                    "{} backup {} has no table structure",
                    backup_type, metadata.id
                )));
            }
            RestoreType::DataOnly if !backup_type.includes_data() => {
                return Err(BackupError::InvalidRequest(format!(
                    "{} backup {} has no rows",
                    backup_type, metadata.id
                )));
            }
            _ => {}
        }

        let tables = if request.restore_type == RestoreType::Selective {
            if request.selected_tables.is_empty() {
                return Err(BackupError::InvalidRequest(
                    "selective restore needs at least one table".into(),
                ));
            }
            for table in &request.selected_tables {
                if table == ledger {
                    return Err(BackupError::InvalidRequest(format!(
                        "table {} is the migration ledger and cannot be restored",
                        table
                    )));
                }
                if !metadata.tables.iter().any(|t| &t.name == table) {
                    return Err(BackupError::InvalidRequest(format!(
                        "table {} is not in backup {}",
                        table, metadata.id
                    )));
                }
            }
            Some(request.selected_tables.iter().cloned().collect())
        } else {
            None
        };

        Ok(Self {
            restore_type: request.restore_type,
            upsert: backup_type.is_change_based(),
            tables,
            ledger: ledger.to_string(),
        })
    }

    fn includes(&self, table: &str) -> bool {
        table != self.ledger && self.tables.as_ref().map_or(true, |t| t.contains(table))
    }
}

/// Why a table could not be restored.
enum TableFailure {
    /// The artifact could not be decoded.
    Stream(Error),
    /// The store rejected a statement.
    Apply(Error),
}

impl From<Error> for TableFailure {
    fn from(e: Error) -> Self {
        TableFailure::Apply(e)
    }
}

impl From<rusqlite::Error> for TableFailure {
    fn from(e: rusqlite::Error) -> Self {
        TableFailure::Apply(e.into())
    }
}

/// Apply an artifact stream to the target store.
///
/// Each table is restored inside one transaction that is opened at its
/// `table` line; rows are inserted as they are read. Returns the restored
/// tables and the number of rows loaded.
pub(crate) fn apply_artifact(
    target: &TargetStore,
    reader: impl BufRead,
    plan: &RestorePlan,
    backup_id: &str,
) -> Result<(Vec<String>, u64), BackupError> {
    let mut restored: Vec<String> = Vec::new();
    let mut total_rows = 0u64;
    let mut lines = DumpReader::new(reader);

    let stream_error = |restored: &[String], table: &str, e: Error| {
        if restored.is_empty() {
            BackupError::IntegrityViolation {
                id: backup_id.to_string(),
                reason: e.to_string(),
            }
        } else {
            BackupError::PartialRestore {
                restored: restored.to_vec(),
                failed_table: table.to_string(),
                reason: e.to_string(),
            }
        }
    };

    match lines.next() {
        Some(Ok(DumpLine::Header { .. })) => {}
        Some(Ok(_)) => {
            return Err(BackupError::IntegrityViolation {
                id: backup_id.to_string(),
                reason: "artifact does not start with a header".into(),
            });
        }
        Some(Err(e)) => return Err(stream_error(&restored, "", e)),
        None => {
            return Err(BackupError::IntegrityViolation {
                id: backup_id.to_string(),
                reason: "artifact is empty".into(),
            });
        }
    }

    while let Some(line) = lines.next() {
        let name = match line.map_err(|e| stream_error(&restored, "", e))? {
            DumpLine::Table { name } => name,
            DumpLine::Header { .. } => continue,
            other => {
                let e = Error::InvalidData(format!("unexpected line outside a table: {:?}", other));
                return Err(stream_error(&restored, "", e));
            }
        };

        if !plan.includes(&name) {
            skip_table(&mut lines, &name).map_err(|e| stream_error(&restored, &name, e))?;
            debug!(table = %name, "table skipped");
            continue;
        }

        match target.transaction(|tx| restore_table(tx, &name, &mut lines, plan)) {
            Ok(rows) => {
                debug!(table = %name, rows, "table restored");
                total_rows += rows;
                restored.push(name);
            }
            Err(TableFailure::Stream(e)) => return Err(stream_error(&restored, &name, e)),
            Err(TableFailure::Apply(e)) => {
                return Err(BackupError::PartialRestore {
                    restored,
                    failed_table: name,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(backup_id, tables = restored.len(), rows = total_rows, "artifact applied");
    Ok((restored, total_rows))
}

/// Read the next line belonging to `table`, stopping at its `end_table`.
fn next_in_table(
    lines: &mut impl Iterator<Item = Result<DumpLine, Error>>,
    table: &str,
) -> Result<Option<DumpLine>, Error> {
    match lines.next() {
        None => Err(Error::InvalidData(format!("artifact ends inside table {}", table))),
        Some(Err(e)) => Err(e),
        Some(Ok(DumpLine::EndTable { .. })) => Ok(None),
        Some(Ok(DumpLine::Table { name })) => Err(Error::InvalidData(format!(
            "table {} is not closed before table {}",
            table, name
        ))),
        Some(Ok(DumpLine::Header { .. })) => Err(Error::InvalidData(format!(
            "header inside table {}",
            table
        ))),
        Some(Ok(line)) => Ok(Some(line)),
    }
}

fn skip_table(lines: &mut impl Iterator<Item = Result<DumpLine, Error>>, table: &str) -> Result<(), Error> {
    while next_in_table(lines, table)?.is_some() {}
    Ok(())
}

fn restore_table(
    conn: &Connection,
    table: &str,
    lines: &mut impl Iterator<Item = Result<DumpLine, Error>>,
    plan: &RestorePlan,
) -> Result<u64, TableFailure> {
    let quoted = quote_ident(table);
    let skip_all = plan.upsert && plan.restore_type == RestoreType::SchemaOnly;
    let recreate = !plan.upsert && plan.restore_type != RestoreType::DataOnly;
    let load = plan.restore_type != RestoreType::SchemaOnly;

    let mut recreated = false;
    let mut insert: Option<(rusqlite::Statement<'_>, usize)> = None;
    let mut rows = 0u64;

    while let Some(line) = next_in_table(lines, table).map_err(TableFailure::Stream)? {
        if skip_all {
            continue;
        }
        match line {
            DumpLine::Structure { sql, .. } if recreate => {
                if !recreated {
                    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted))?;
                    recreated = true;
                }
                conn.execute_batch(&sql)?;
            }
            DumpLine::Columns { names, .. } if load => {
                if !recreated {
                    if !table_exists(conn, table)? {
                        return Err(TableFailure::Apply(Error::InvalidData(format!(
                            "table {} does not exist",
                            table
                        ))));
                    }
                    if !plan.upsert {
                        conn.execute(&format!("DELETE FROM {}", quoted), [])?;
                    }
                }
                if !names.is_empty() {
                    let verb = if plan.upsert { "INSERT OR REPLACE" } else { "INSERT" };
                    insert = Some((conn.prepare(&insert_sql(verb, table, &names))?, names.len()));
                }
            }
            DumpLine::Row { values, .. } if load => {
                let Some((stmt, width)) = insert.as_mut() else {
                    continue;
                };
                if values.len() != *width {
                    return Err(TableFailure::Apply(Error::InvalidData(format!(
                        "row of {} has {} values for {} columns",
                        table,
                        values.len(),
                        width
                    ))));
                }
                stmt.execute(rusqlite::params_from_iter(values.iter()))?;
                rows += 1;
            }
            _ => {}
        }
    }
    Ok(rows)
}

fn insert_sql(verb: &str, table: &str, columns: &[String]) -> String {
    format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        (1..=columns.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", "),
    )
}
