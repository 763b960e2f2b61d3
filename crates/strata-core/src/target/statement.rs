//! Splitting multi-statement scripts into executable statements.
//!
//! Scripts are split on `;` after dropping comment lines (lines whose first
//! non-blank characters are `--`). A `;` inside a string literal or a
//! `--` inside a statement line is not understood and will split or cut the
//! statement; scripts that need such content must avoid it.

use rusqlite::Connection;

/// Statement separator.
pub const STATEMENT_SEPARATOR: char = ';';

/// Comment line marker.
pub const COMMENT_PREFIX: &str = "--";

/// Split a script into trimmed, non-empty statements without separators.
pub fn split_statements(script: &str) -> Vec<String> {
    let without_comments: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with(COMMENT_PREFIX))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(STATEMENT_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A statement that failed while executing a script.
#[derive(Debug)]
pub struct StatementFailure {
    /// Zero-based position of the statement in the script.
    pub index: usize,
    /// The statement text.
    pub statement: String,
    /// The store's error.
    pub source: rusqlite::Error,
}

/// Execute each statement of a script in order, stopping at the first error.
///
/// Returns the number of statements executed. Transaction control is the
/// caller's responsibility.
pub fn execute_script(conn: &Connection, script: &str) -> Result<usize, StatementFailure> {
    let statements = split_statements(script);
    for (index, statement) in statements.iter().enumerate() {
        conn.execute_batch(statement).map_err(|source| StatementFailure {
            index,
            statement: statement.clone(),
            source,
        })?;
    }
    Ok(statements.len())
}

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
