//! The backup dump format.
//!
//! An artifact is a JSON Lines stream of [`DumpLine`]s: one `header`, then
//! for each table a `table` line, its `structure` statements (table first,
//! then indexes and triggers), a `columns` line, one `row` per row and a
//! closing `end_table`. Tables appear contiguously, so a reader can restore
//! them one at a time.
//!
//! The checksum covers the uncompressed lines exactly as written.

use std::io::{BufRead, Write};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::metadata::{BackupType, TableSummary};
use crate::checksum::{ChecksumHasher, ChecksumProvider};
use crate::error::Error;
use crate::target::{quote_ident, table_columns, SqlValue};

/// Version of the dump format written by this crate.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Text form of timestamps compared against last-modified columns.
pub const MODIFIED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One line of a dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpLine {
    Header {
        format_version: u32,
        backup_id: String,
        backup_type: BackupType,
        store_version: Option<String>,
        created_at: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    },
    Table {
        name: String,
    },
    Structure {
        table: String,
        sql: String,
    },
    Columns {
        table: String,
        names: Vec<String>,
    },
    Row {
        table: String,
        values: Vec<SqlValue>,
    },
    EndTable {
        table: String,
        rows: u64,
    },
}

/// Writes dump lines while hashing them.
pub struct DumpWriter<'a> {
    out: &'a mut dyn Write,
    hasher: Box<dyn ChecksumHasher>,
    bytes: u64,
    buf: Vec<u8>,
}

impl<'a> DumpWriter<'a> {
    /// Write to `out`, hashing with a fresh hasher from `checksum`.
    pub fn new(out: &'a mut dyn Write, checksum: &dyn ChecksumProvider) -> Self {
        Self {
            out,
            hasher: checksum.hasher(),
            bytes: 0,
            buf: Vec::with_capacity(256),
        }
    }

    /// Append one line.
    pub fn write_line(&mut self, line: &DumpLine) -> Result<(), Error> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, line)?;
        self.buf.push(b'\n');
        self.hasher.update(&self.buf);
        self.out.write_all(&self.buf)?;
        self.bytes += self.buf.len() as u64;
        Ok(())
    }

    /// Digest and byte count of everything written.
    pub fn finish(self) -> (String, u64) {
        (self.hasher.finalize(), self.bytes)
    }
}

/// Iterates the lines of a dump.
pub struct DumpReader<R> {
    inner: R,
    line: String,
    line_no: usize,
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpLine, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.inner.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    let text = self.line.trim_end();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(text).map_err(|e| {
                        Error::InvalidData(format!("dump line {}: {}", self.line_no, e))
                    }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Digest and size of a decompressed artifact stream.
pub fn checksum_stream(mut reader: impl BufRead, checksum: &dyn ChecksumProvider) -> Result<(String, u64), Error> {
    let mut hasher = checksum.hasher();
    let mut total = 0u64;
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        hasher.update(chunk);
        total += len as u64;
        reader.consume(len);
    }
    Ok((hasher.finalize(), total))
}

/// What to capture from each table.
#[derive(Debug, Clone)]
pub struct DumpScope<'a> {
    pub structure: bool,
    pub data: bool,
    /// Only rows whose `modified_column` is at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub modified_column: &'a str,
}

impl<'a> DumpScope<'a> {
    /// Scope implied by a backup type.
    pub fn for_type(backup_type: BackupType, since: Option<DateTime<Utc>>, modified_column: &'a str) -> Self {
        Self {
            structure: backup_type.includes_structure(),
            data: backup_type.includes_data(),
            since: since.filter(|_| backup_type.is_change_based()),
            modified_column,
        }
    }
}

/// Dump the given tables and return what was written for each.
///
/// Tables lacking the last-modified column are skipped when `scope.since`
/// is set.
pub fn dump_tables(
    conn: &Connection,
    tables: &[String],
    scope: &DumpScope<'_>,
    writer: &mut DumpWriter<'_>,
) -> Result<Vec<TableSummary>, Error> {
    let mut summaries = Vec::with_capacity(tables.len());

    for table in tables {
        let columns = table_columns(conn, table)?;
        if scope.since.is_some() && !columns.iter().any(|c| c == scope.modified_column) {
            warn!(
                table = %table,
                column = scope.modified_column,
                "table has no last-modified column, skipping"
            );
            continue;
        }

        writer.write_line(&DumpLine::Table { name: table.clone() })?;

        if scope.structure {
            for sql in structure_statements(conn, table)? {
                writer.write_line(&DumpLine::Structure {
                    table: table.clone(),
                    sql,
                })?;
            }
        }

        let mut rows = 0u64;
        if scope.data {
            writer.write_line(&DumpLine::Columns {
                table: table.clone(),
                names: columns.clone(),
            })?;
            rows = dump_rows(conn, table, &columns, scope, writer)?;
        }

        writer.write_line(&DumpLine::EndTable {
            table: table.clone(),
            rows,
        })?;
        summaries.push(TableSummary {
            name: table.clone(),
            row_count: rows,
        });
    }

    Ok(summaries)
}

fn structure_statements(conn: &Connection, table: &str) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE tbl_name = ?1 AND sql IS NOT NULL
         ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
    )?;
    let statements = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(statements)
}

fn dump_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
    scope: &DumpScope<'_>,
    writer: &mut DumpWriter<'_>,
) -> Result<u64, Error> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {} FROM {}", column_list, quote_ident(table));
    let mut params: Vec<SqlValue> = Vec::new();
    if let Some(since) = scope.since {
        // Numeric values are compared as epoch seconds, text as timestamps.
        let column = quote_ident(scope.modified_column);
        sql.push_str(&format!(
            " WHERE (typeof({c}) IN ('integer', 'real') AND {c} >= ?1) \
             OR (typeof({c}) = 'text' AND {c} >= ?2)",
            c = column
        ));
        params.push(SqlValue::Integer(since.timestamp()));
        params.push(SqlValue::Text(since.format(MODIFIED_TIME_FORMAT).to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut result = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut count = 0u64;
    while let Some(row) = result.next()? {
        let values = (0..columns.len())
            .map(|i| row.get_ref(i).map(SqlValue::from))
            .collect::<Result<Vec<_>, _>>()?;
        writer.write_line(&DumpLine::Row {
            table: table.to_string(),
            values,
        })?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Sha256Checksum;
    use chrono::TimeZone;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, updated_at TEXT);
             CREATE INDEX users_name ON users(name);
             CREATE TABLE tags (label TEXT);
             INSERT INTO users VALUES (1, 'ada', '2024-01-01 00:00:00');
             INSERT INTO users VALUES (2, 'bob', '2024-03-01 12:00:00');
             INSERT INTO tags VALUES ('x');",
        )
        .unwrap();
        conn
    }

    fn dump(conn: &Connection, scope: &DumpScope<'_>) -> (Vec<DumpLine>, Vec<TableSummary>, String) {
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out, &Sha256Checksum);
        let tables = vec!["tags".to_string(), "users".to_string()];
        let summaries = dump_tables(conn, &tables, scope, &mut writer).unwrap();
        let (checksum, bytes) = writer.finish();
        assert_eq!(bytes, out.len() as u64);
        assert_eq!(checksum, Sha256Checksum.hash(&out));
        let lines = DumpReader::new(out.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        (lines, summaries, checksum)
    }

    #[test]
    fn test_full_dump_layout() {
        let conn = seeded();
        let scope = DumpScope::for_type(BackupType::Full, None, "updated_at");
        let (lines, summaries, _) = dump(&conn, &scope);

        assert_eq!(summaries[1], TableSummary { name: "users".into(), row_count: 2 });
        let users_start = lines
            .iter()
            .position(|l| matches!(l, DumpLine::Table { name } if name == "users"))
            .unwrap();
        match (&lines[users_start + 1], &lines[users_start + 2]) {
            (DumpLine::Structure { sql: table_sql, .. }, DumpLine::Structure { sql: index_sql, .. }) => {
                assert!(table_sql.starts_with("CREATE TABLE users"));
                assert!(index_sql.starts_with("CREATE INDEX users_name"));
            }
            other => panic!("unexpected lines: {other:?}"),
        }
        assert!(matches!(
            lines.last(),
            Some(DumpLine::EndTable { table, rows: 2 }) if table == "users"
        ));
    }

    #[test]
    fn test_schema_only_has_no_rows() {
        let conn = seeded();
        let scope = DumpScope::for_type(BackupType::SchemaOnly, None, "updated_at");
        let (lines, _, _) = dump(&conn, &scope);
        assert!(!lines.iter().any(|l| matches!(l, DumpLine::Row { .. } | DumpLine::Columns { .. })));
        assert!(lines.iter().any(|l| matches!(l, DumpLine::Structure { .. })));
    }

    #[test]
    fn test_incremental_filters_and_skips() {
        let conn = seeded();
        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let scope = DumpScope::for_type(BackupType::Incremental, Some(since), "updated_at");
        let (lines, summaries, _) = dump(&conn, &scope);

        assert_eq!(summaries, vec![TableSummary { name: "users".into(), row_count: 1 }]);
        let rows: Vec<_> = lines
            .iter()
            .filter_map(|l| match l {
                DumpLine::Row { values, .. } => Some(values[1].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec![SqlValue::Text("bob".into())]);
        assert!(!lines.iter().any(|l| matches!(l, DumpLine::Structure { .. })));
    }

    #[test]
    fn test_incremental_compares_epoch_columns_numerically() {
        let conn = Connection::open_in_memory().unwrap();
        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        conn.execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at INTEGER)")
            .unwrap();
        conn.execute(
            "INSERT INTO events VALUES (1, ?1), (2, ?2), (3, ?3)",
            [since.timestamp() - 60, since.timestamp(), since.timestamp() + 60],
        )
        .unwrap();

        let scope = DumpScope::for_type(BackupType::Incremental, Some(since), "updated_at");
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out, &Sha256Checksum);
        let summaries = dump_tables(&conn, &["events".to_string()], &scope, &mut writer).unwrap();
        assert_eq!(summaries, vec![TableSummary { name: "events".into(), row_count: 2 }]);
    }

    #[test]
    fn test_reader_reports_bad_lines() {
        let input = b"{\"kind\":\"table\",\"name\":\"t\"}\n\nnot json\n";
        let results: Vec<_> = DumpReader::new(&input[..]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().to_string().contains("line 3"));
    }

    #[test]
    fn test_checksum_stream_matches_writer() {
        let conn = seeded();
        let scope = DumpScope::for_type(BackupType::Full, None, "updated_at");
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out, &Sha256Checksum);
        dump_tables(&conn, &["users".to_string()], &scope, &mut writer).unwrap();
        let (checksum, bytes) = writer.finish();
        assert_eq!(checksum_stream(out.as_slice(), &Sha256Checksum).unwrap(), (checksum, bytes));
    }
}
