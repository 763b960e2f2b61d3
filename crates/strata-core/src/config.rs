//! Engine configuration.
//!
//! Read once at startup and treated as immutable for the process lifetime.

use std::path::PathBuf;
use std::time::Duration;

/// Default retention period for completed backups.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default name of the migration ledger table.
pub const DEFAULT_HISTORY_TABLE: &str = "schema_migrations";

/// Default last-modified column used for incremental backups.
pub const DEFAULT_MODIFIED_COLUMN: &str = "updated_at";

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the engine and its components.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding `migrations/`, `backups/` and `recovery/`.
    pub storage_root: PathBuf,

    /// Path to the target SQLite database.
    pub database_path: PathBuf,

    /// Completed backups older than this are removed by retention cleanup.
    pub retention_days: u32,

    /// Compress backup artifacts by default.
    pub compress_backups: bool,

    /// Tables never included in backups.
    pub excluded_tables: Vec<String>,

    /// Name of the migration ledger table.
    pub history_table: String,

    /// Last-modified column consulted by incremental and differential backups.
    pub modified_column: String,

    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,

    /// Base delay between recovery step retries, doubled per attempt.
    /// None retries immediately.
    pub retry_backoff: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("./strata")
    }
}

impl EngineConfig {
    /// Create a configuration rooted at the given directory.
    ///
    /// The database defaults to `<root>/data.db`.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let database_path = storage_root.join("data.db");
        Self {
            storage_root,
            database_path,
            retention_days: DEFAULT_RETENTION_DAYS,
            compress_backups: true,
            excluded_tables: Vec::new(),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            modified_column: DEFAULT_MODIFIED_COLUMN.to_string(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retry_backoff: None,
        }
    }

    /// Set the target database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the backup retention period.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Enable or disable backup compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_backups = compress;
        self
    }

    /// Exclude a table from backups.
    pub fn exclude_table(mut self, table: impl Into<String>) -> Self {
        self.excluded_tables.push(table.into());
        self
    }

    /// Set the ledger table name.
    pub fn with_history_table(mut self, table: impl Into<String>) -> Self {
        self.history_table = table.into();
        self
    }

    /// Set the last-modified column name.
    pub fn with_modified_column(mut self, column: impl Into<String>) -> Self {
        self.modified_column = column.into();
        self
    }

    /// Set the SQLite busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the recovery step retry backoff.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = Some(base);
        self
    }

    /// Directory holding migration scripts.
    pub fn migrations_dir(&self) -> PathBuf {
        self.storage_root.join("migrations")
    }

    /// Directory holding backup artifacts and their sidecars.
    pub fn backups_dir(&self) -> PathBuf {
        self.storage_root.join("backups")
    }

    /// Directory holding the recovery plan store.
    pub fn recovery_dir(&self) -> PathBuf {
        self.storage_root.join("recovery")
    }

    /// Whether a table is excluded from backups.
    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.storage_root, PathBuf::from("./strata"));
        assert_eq!(config.database_path, PathBuf::from("./strata/data.db"));
        assert_eq!(config.retention_days, DEFAULT_RETENTION_DAYS);
        assert!(config.compress_backups);
        assert!(config.excluded_tables.is_empty());
        assert_eq!(config.history_table, "schema_migrations");
        assert!(config.retry_backoff.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/var/lib/strata")
            .with_database_path("/srv/app.db")
            .with_retention_days(7)
            .with_compression(false)
            .exclude_table("sessions")
            .with_history_table("ledger")
            .with_modified_column("modified_at")
            .with_retry_backoff(Duration::from_millis(250));

        assert_eq!(config.database_path, PathBuf::from("/srv/app.db"));
        assert_eq!(config.retention_days, 7);
        assert!(!config.compress_backups);
        assert!(config.is_excluded("sessions"));
        assert!(!config.is_excluded("users"));
        assert_eq!(config.history_table, "ledger");
        assert_eq!(config.modified_column, "modified_at");
        assert_eq!(config.retry_backoff, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_directories() {
        let config = EngineConfig::new("/data");
        assert_eq!(config.migrations_dir(), PathBuf::from("/data/migrations"));
        assert_eq!(config.backups_dir(), PathBuf::from("/data/backups"));
        assert_eq!(config.recovery_dir(), PathBuf::from("/data/recovery"));
    }
}
