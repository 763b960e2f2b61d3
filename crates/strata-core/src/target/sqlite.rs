//! Access to the target SQLite store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use super::statement::quote_ident;
use crate::config::EngineConfig;
use crate::error::Error;

/// The relational store being migrated and backed up.
///
/// One connection is held per instance and serialised with a mutex. Separate
/// instances (or processes) against the same file are coordinated by
/// SQLite's own locking.
pub struct TargetStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TargetStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        debug!(path = %path.display(), "target store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open the configured database.
    pub fn from_config(config: &EngineConfig) -> Result<Self, Error> {
        Self::open(&config.database_path, config.busy_timeout)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, Error> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure with exclusive access to the connection.
    pub fn with_connection<T, E>(&self, f: impl FnOnce(&mut Connection) -> Result<T, E>) -> Result<T, E> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// Run a closure inside a write transaction.
    ///
    /// The transaction starts with `BEGIN IMMEDIATE`, so the write lock is
    /// taken up front and reads inside the closure see a stable state. It is
    /// committed when the closure returns `Ok` and rolled back otherwise.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| E::from(Error::from(e)))?;
            let value = f(&tx)?;
            tx.commit().map_err(|e| E::from(Error::from(e)))?;
            Ok(value)
        })
    }

    /// Run a closure inside a read transaction, giving it a consistent snapshot.
    pub fn snapshot<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Deferred)
                .map_err(|e| E::from(Error::from(e)))?;
            let value = f(&tx)?;
            tx.finish().map_err(|e| E::from(Error::from(e)))?;
            Ok(value)
        })
    }

    /// List user tables, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>, Error> {
        self.with_connection(|conn| list_tables(conn))
    }

    /// Whether a table exists.
    pub fn table_exists(&self, table: &str) -> Result<bool, Error> {
        self.with_connection(|conn| table_exists(conn, table))
    }

    /// Count the rows of a table.
    pub fn row_count(&self, table: &str) -> Result<u64, Error> {
        self.with_connection(|conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

/// List user tables on a connection, sorted by name.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Whether a table exists on a connection.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a table, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (TargetStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TargetStore::open(dir.path().join("target.db"), Duration::from_secs(1)).unwrap();
        (store, dir)
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let (store, _dir) = test_store();
        store
            .transaction(|tx| {
                tx.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
                tx.execute("INSERT INTO users (name) VALUES ('ada')", [])?;
                Ok::<_, Error>(())
            })
            .unwrap();
        assert_eq!(store.row_count("users").unwrap(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let (store, _dir) = test_store();
        store
            .with_connection(|conn| conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY)"))
            .unwrap();

        let result = store.transaction(|tx| {
            tx.execute("INSERT INTO users (id) VALUES (1)", [])?;
            Err::<(), _>(Error::InvalidData("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.row_count("users").unwrap(), 0);
    }

    #[test]
    fn test_list_tables_and_columns() {
        let (store, _dir) = test_store();
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT);
                     CREATE TABLE authors (id INTEGER, name TEXT, updated_at TEXT);",
                )
            })
            .unwrap();

        assert_eq!(store.list_tables().unwrap(), vec!["authors", "posts"]);
        assert!(store.table_exists("posts").unwrap());
        assert!(!store.table_exists("comments").unwrap());

        let columns = store
            .with_connection(|conn| table_columns(conn, "authors"))
            .unwrap();
        assert_eq!(columns, vec!["id", "name", "updated_at"]);
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db").join("target.db");
        let store = TargetStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }
}
