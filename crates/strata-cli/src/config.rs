//! Command-line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use strata_core::config::{
    DEFAULT_BUSY_TIMEOUT, DEFAULT_HISTORY_TABLE, DEFAULT_MODIFIED_COLUMN, DEFAULT_RETENTION_DAYS,
};
use strata_core::EngineConfig;

use crate::commands::Command;
use crate::formatter::OutputFormat;

/// Strata - schema migrations, backups and recovery plans.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about = "Schema migration, backup and recovery orchestration", long_about = None)]
pub struct Args {
    /// Directory holding migrations/, backups/ and recovery/.
    #[arg(short, long, env = "STRATA_ROOT", default_value = "./strata", global = true)]
    pub root: PathBuf,

    /// Target SQLite database (defaults to <root>/data.db).
    #[arg(short, long, env = "STRATA_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Days a completed backup is kept.
    #[arg(long, env = "STRATA_RETENTION_DAYS", default_value_t = DEFAULT_RETENTION_DAYS, global = true)]
    pub retention_days: u32,

    /// Write backup artifacts uncompressed.
    #[arg(long, env = "STRATA_NO_COMPRESS", global = true)]
    pub no_compress: bool,

    /// Table to leave out of backups (repeatable).
    #[arg(long = "exclude", env = "STRATA_EXCLUDE", value_delimiter = ',', global = true)]
    pub excluded_tables: Vec<String>,

    /// Name of the migration ledger table.
    #[arg(long, env = "STRATA_HISTORY_TABLE", default_value = DEFAULT_HISTORY_TABLE, global = true)]
    pub history_table: String,

    /// Last-modified column used by incremental backups.
    #[arg(long, env = "STRATA_MODIFIED_COLUMN", default_value = DEFAULT_MODIFIED_COLUMN, global = true)]
    pub modified_column: String,

    /// How long to wait on a locked database, in milliseconds.
    #[arg(long, env = "STRATA_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT.as_millis() as u64, global = true)]
    pub busy_timeout_ms: u64,

    /// Base delay between recovery step retries in milliseconds. 0 retries immediately.
    #[arg(long, env = "STRATA_RETRY_BACKOFF_MS", default_value_t = 0, global = true)]
    pub retry_backoff_ms: u64,

    /// Output format.
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Convert command-line arguments to engine configuration.
    pub fn to_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.root)
            .with_retention_days(self.retention_days)
            .with_compression(!self.no_compress)
            .with_history_table(&self.history_table)
            .with_modified_column(&self.modified_column)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms));

        if let Some(database) = &self.database {
            config = config.with_database_path(database);
        }
        for table in &self.excluded_tables {
            config = config.exclude_table(table);
        }
        if self.retry_backoff_ms > 0 {
            config = config.with_retry_backoff(Duration::from_millis(self.retry_backoff_ms));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["strata", "status"]).unwrap();
        let config = args.to_config();

        assert_eq!(config.storage_root, PathBuf::from("./strata"));
        assert_eq!(config.database_path, PathBuf::from("./strata/data.db"));
        assert_eq!(config.retention_days, DEFAULT_RETENTION_DAYS);
        assert!(config.compress_backups);
        assert_eq!(config.history_table, "schema_migrations");
        assert!(config.retry_backoff.is_none());
        assert!(matches!(args.command, Command::Status));
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "strata",
            "--root",
            "/srv/strata",
            "--database",
            "/srv/app.db",
            "--no-compress",
            "--exclude",
            "sessions,cache",
            "--retry-backoff-ms",
            "200",
            "backups",
        ])
        .unwrap();
        let config = args.to_config();

        assert_eq!(config.database_path, PathBuf::from("/srv/app.db"));
        assert!(!config.compress_backups);
        assert!(config.is_excluded("sessions"));
        assert!(config.is_excluded("cache"));
        assert_eq!(config.retry_backoff, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["strata", "migrate", "--format", "json"]).unwrap();
        assert_eq!(args.format, OutputFormat::Json);
    }
}
