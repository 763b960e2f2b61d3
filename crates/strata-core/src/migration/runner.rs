//! Migration runner - applies, rolls back and verifies migrations.
//!
//! Each migration is applied inside one `BEGIN IMMEDIATE` transaction that
//! also inserts its ledger row, so "script applied" and "history updated"
//! commit together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::catalog::{MalformedFile, MigrationCatalog};
use super::definition::{new_version, MigrationDefinition, MigrationDraft};
use super::error::MigrationError;
use super::history::{is_unique_violation, MigrationHistory, MigrationRecord};
use crate::checksum::{ChecksumProvider, Sha256Checksum};
use crate::error::Error;
use crate::store::ScriptStore;
use crate::target::{execute_script, TargetStore};

/// Result of a `run_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
    /// Versions a concurrent runner applied first.
    pub skipped: Vec<String>,
}

impl RunReport {
    /// Whether the run changed nothing.
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A discrepancy between the ledger and the migration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// An applied migration's file changed after it was applied.
    ChecksumMismatch {
        version: String,
        recorded: String,
        current: String,
    },
    /// An applied migration's file no longer exists.
    MissingMigrationFile { version: String },
    /// An applied migration's file exists but no longer parses.
    MalformedMigrationFile {
        version: String,
        file: String,
        reason: String,
    },
}

impl IntegrityIssue {
    /// Version the issue concerns.
    pub fn version(&self) -> &str {
        match self {
            IntegrityIssue::ChecksumMismatch { version, .. }
            | IntegrityIssue::MissingMigrationFile { version }
            | IntegrityIssue::MalformedMigrationFile { version, .. } => version,
        }
    }
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::ChecksumMismatch {
                version,
                recorded,
                current,
            } => write!(
                f,
                "checksum mismatch for {}: recorded {}, file {}",
                version, recorded, current
            ),
            IntegrityIssue::MissingMigrationFile { version } => {
                write!(f, "migration file for applied version {} is missing", version)
            }
            IntegrityIssue::MalformedMigrationFile { version, file, reason } => {
                write!(f, "migration file {} for {} is malformed: {}", file, version, reason)
            }
        }
    }
}

/// Snapshot of migration state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatusReport {
    /// Greatest applied version.
    pub current_version: Option<String>,
    pub applied: Vec<String>,
    /// What the next `run_pending` would attempt, in order.
    pub pending: Vec<String>,
    /// Rolled back and awaiting an explicit re-apply.
    pub rolled_back: Vec<String>,
    /// Most recent attempt failed.
    pub failed: Vec<String>,
    pub malformed: Vec<MalformedFile>,
}

enum Applied {
    Applied,
    Skipped,
}

/// Applies migrations from a script store to a target store.
pub struct MigrationRunner {
    target: Arc<TargetStore>,
    scripts: ScriptStore,
    history: MigrationHistory,
    checksum: Arc<dyn ChecksumProvider>,
}

impl MigrationRunner {
    /// Create a runner and make sure the ledger table exists.
    pub fn new(
        target: Arc<TargetStore>,
        scripts: ScriptStore,
        history: MigrationHistory,
    ) -> Result<Self, MigrationError> {
        target.with_connection(|conn| history.ensure_schema(conn))?;
        Ok(Self {
            target,
            scripts,
            history,
            checksum: Arc::new(Sha256Checksum),
        })
    }

    /// Use a different checksum provider.
    pub fn with_checksum(mut self, checksum: Arc<dyn ChecksumProvider>) -> Self {
        self.checksum = checksum;
        self
    }

    /// The ledger accessor.
    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    /// Load the catalog from the script store.
    pub fn catalog(&self) -> Result<MigrationCatalog, MigrationError> {
        Ok(MigrationCatalog::load(&self.scripts, self.checksum.as_ref())?)
    }

    /// Every ledger record, oldest first.
    pub fn records(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.target.snapshot(|tx| self.history.all_records(tx))
    }

    /// Greatest applied version.
    pub fn current_version(&self) -> Result<Option<String>, MigrationError> {
        self.target.snapshot(|tx| self.history.current_version(tx))
    }

    /// Apply every pending migration in version order.
    ///
    /// Stops at the first unmet dependency or failing statement; migrations
    /// applied before that point stay applied and are listed in the error.
    #[instrument(skip(self))]
    pub fn run_pending(&self) -> Result<RunReport, MigrationError> {
        let catalog = self.catalog()?;
        let excluded = self.target.snapshot(|tx| {
            let mut excluded = self.history.applied_versions(tx)?;
            excluded.extend(self.history.rolled_back_versions(tx)?);
            Ok::<_, MigrationError>(excluded)
        })?;

        let pending = catalog.pending(&excluded);
        if pending.is_empty() {
            info!("no pending migrations");
            return Ok(RunReport::default());
        }
        info!(count = pending.len(), "applying pending migrations");

        let mut report = RunReport::default();
        for definition in pending {
            match self.apply(definition, &report.applied)? {
                Applied::Applied => report.applied.push(definition.version.clone()),
                Applied::Skipped => report.skipped.push(definition.version.clone()),
            }
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migration run complete"
        );
        Ok(report)
    }

    fn apply(
        &self,
        definition: &MigrationDefinition,
        applied_in_run: &[String],
    ) -> Result<Applied, MigrationError> {
        let version = &definition.version;
        let executed_at = Utc::now();
        let started = Instant::now();

        let result = self.target.transaction(|tx| {
            let applied = self.history.applied_versions(tx)?;
            if applied.contains(version) {
                return Ok(Applied::Skipped);
            }

            if let Some(missing) = definition.dependencies.iter().find(|d| !applied.contains(*d)) {
                return Err(MigrationError::UnmetDependency {
                    version: version.clone(),
                    dependency: missing.clone(),
                    applied: applied_in_run.to_vec(),
                });
            }

            let statements = execute_script(tx, &definition.up_script).map_err(|failure| {
                MigrationError::StatementExecutionFailed {
                    version: version.clone(),
                    statement_index: failure.index,
                    statement: failure.statement,
                    message: failure.source.to_string(),
                    applied: applied_in_run.to_vec(),
                }
            })?;

            let elapsed = started.elapsed().as_millis() as u64;
            self.history
                .record_attempt(tx, &MigrationRecord::success(definition, executed_at, elapsed))?;
            info!(version = %version, statements, elapsed_ms = elapsed, "migration applied");
            Ok(Applied::Applied)
        });

        match result {
            Ok(outcome) => {
                if matches!(outcome, Applied::Skipped) {
                    info!(version = %version, "already applied by another runner, skipping");
                }
                Ok(outcome)
            }
            Err(MigrationError::AlreadyApplied { .. }) => {
                info!(version = %version, "lost apply race to another runner, skipping");
                Ok(Applied::Skipped)
            }
            Err(MigrationError::Storage(Error::Sqlite(ref e))) if is_unique_violation(e) => {
                info!(version = %version, "lost apply race to another runner, skipping");
                Ok(Applied::Skipped)
            }
            Err(err @ MigrationError::StatementExecutionFailed { .. }) => {
                error!(version = %version, error = %err, "migration failed, transaction rolled back");
                let elapsed = started.elapsed().as_millis() as u64;
                let failure = MigrationRecord::failure(definition, executed_at, elapsed, err.to_string());
                if let Err(record_err) = self
                    .target
                    .transaction(|tx| self.history.record_attempt(tx, &failure))
                {
                    error!(version = %version, error = %record_err, "failed to record migration failure");
                }
                Err(err)
            }
            Err(err) => {
                warn!(version = %version, error = %err, "migration run aborted");
                Err(err)
            }
        }
    }

    /// Revert an applied migration using the down script stored with its record.
    #[instrument(skip(self))]
    pub fn rollback(&self, version: &str) -> Result<(), MigrationError> {
        self.target.transaction(|tx| {
            let record = self
                .history
                .latest_successful(tx, version)?
                .ok_or_else(|| MigrationError::NotApplied {
                    version: version.to_string(),
                })?;
            let script = record
                .rollback_script
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| MigrationError::NoRollbackScript {
                    version: version.to_string(),
                })?;

            execute_script(tx, &script).map_err(|failure| MigrationError::RollbackFailed {
                version: version.to_string(),
                statement_index: failure.index,
                message: failure.source.to_string(),
            })?;
            self.history.mark_rolled_back(tx, version, Utc::now())
        })?;

        info!(version, "migration rolled back");
        Ok(())
    }

    /// Apply a rolled-back migration again.
    ///
    /// Rolled-back versions are never picked up by `run_pending`; this is the
    /// explicit way back in.
    #[instrument(skip(self))]
    pub fn reapply(&self, version: &str) -> Result<(), MigrationError> {
        let catalog = self.catalog()?;
        let definition = catalog
            .by_version(version)
            .ok_or_else(|| MigrationError::NotFound {
                version: version.to_string(),
            })?;

        match self.apply(definition, &[])? {
            Applied::Applied => Ok(()),
            Applied::Skipped => Err(MigrationError::AlreadyApplied {
                version: version.to_string(),
            }),
        }
    }

    /// Compare applied records against the files on disk.
    ///
    /// Returns every discrepancy found; an empty list means the ledger and
    /// the files agree.
    #[instrument(skip(self))]
    pub fn verify_integrity(&self) -> Result<Vec<IntegrityIssue>, MigrationError> {
        let catalog = self.catalog()?;
        let applied = self.target.snapshot(|tx| {
            let versions = self.history.applied_versions(tx)?;
            versions
                .iter()
                .filter_map(|v| self.history.latest_successful(tx, v).transpose())
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut issues = Vec::new();
        for record in applied {
            match catalog.by_version(&record.version) {
                Some(definition) if definition.checksum != record.checksum => {
                    issues.push(IntegrityIssue::ChecksumMismatch {
                        version: record.version,
                        recorded: record.checksum,
                        current: definition.checksum.clone(),
                    });
                }
                Some(_) => {}
                None => match catalog.malformed_version(&record.version) {
                    Some(malformed) => issues.push(IntegrityIssue::MalformedMigrationFile {
                        version: record.version,
                        file: malformed.file.clone(),
                        reason: malformed.reason.clone(),
                    }),
                    None => issues.push(IntegrityIssue::MissingMigrationFile {
                        version: record.version,
                    }),
                },
            }
        }

        if issues.is_empty() {
            info!("migration integrity verified");
        } else {
            for issue in &issues {
                warn!(version = issue.version(), "{}", issue);
            }
        }
        Ok(issues)
    }

    /// Current migration state.
    pub fn status(&self) -> Result<MigrationStatusReport, MigrationError> {
        let catalog = self.catalog()?;
        let (applied, rolled_back, failed, current_version) = self.target.snapshot(|tx| {
            Ok::<_, MigrationError>((
                self.history.applied_versions(tx)?,
                self.history.rolled_back_versions(tx)?,
                self.history.failed_versions(tx)?,
                self.history.current_version(tx)?,
            ))
        })?;

        let excluded: BTreeSet<String> = applied.union(&rolled_back).cloned().collect();
        let pending = catalog
            .pending(&excluded)
            .into_iter()
            .map(|d| d.version.clone())
            .collect();

        Ok(MigrationStatusReport {
            current_version,
            applied: applied.into_iter().collect(),
            pending,
            rolled_back: rolled_back.into_iter().collect(),
            failed: failed.into_iter().collect(),
            malformed: catalog.malformed().to_vec(),
        })
    }

    /// Write a new migration file with a fresh version and return its definition.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub fn generate(&self, mut draft: MigrationDraft) -> Result<MigrationDefinition, MigrationError> {
        let now = Utc::now();
        let version = new_version(now, &draft.name);
        let file = MigrationDefinition::file_name(&version);

        if draft.up_script.trim().is_empty() {
            draft.up_script = "-- Write the migration statements here".to_string();
        }
        let content = draft.render(&version, Some(now));

        self.scripts
            .write_migration_file(&file, &content)
            .map_err(|e| match e {
                Error::InvalidData(_) => MigrationError::AlreadyExists { file: file.clone() },
                other => MigrationError::Storage(other),
            })?;
        info!(version = %version, "migration file generated");

        MigrationDefinition::parse(&file, &content, self.checksum.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    struct Fixture {
        runner: MigrationRunner,
        target: Arc<TargetStore>,
        scripts: ScriptStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(
            TargetStore::open(dir.path().join("data.db"), Duration::from_secs(5)).unwrap(),
        );
        let scripts = ScriptStore::new(dir.path().join("migrations"), dir.path().join("backups"));
        scripts.ensure_dirs().unwrap();
        let runner = MigrationRunner::new(
            Arc::clone(&target),
            scripts.clone(),
            MigrationHistory::new("schema_migrations"),
        )
        .unwrap();
        Fixture {
            runner,
            target,
            scripts,
            _dir: dir,
        }
    }

    fn write(f: &Fixture, version: &str, body: &str) {
        fs::write(f.scripts.migrations_dir().join(format!("{}.sql", version)), body).unwrap();
    }

    #[test]
    fn test_run_pending_applies_in_order() {
        let f = fixture();
        write(&f, "20240101T000000_users", "-- UP\nCREATE TABLE users (id INTEGER PRIMARY KEY);");
        write(
            &f,
            "20240102T000000_posts",
            "-- Dependencies: 20240101T000000_users\n-- UP\nCREATE TABLE posts (id INTEGER, user_id INTEGER);",
        );

        let report = f.runner.run_pending().unwrap();
        assert_eq!(report.applied, vec!["20240101T000000_users", "20240102T000000_posts"]);
        assert!(f.target.table_exists("posts").unwrap());
        assert_eq!(
            f.runner.current_version().unwrap().as_deref(),
            Some("20240102T000000_posts")
        );

        let again = f.runner.run_pending().unwrap();
        assert!(again.is_empty());
        assert_eq!(f.runner.records().unwrap().len(), 2);
    }

    #[test]
    fn test_unmet_dependency_aborts_run() {
        let f = fixture();
        write(&f, "20240101T000000_a", "-- UP\nCREATE TABLE a (id INTEGER);");
        write(
            &f,
            "20240102T000000_b",
            "-- Dependencies: 20230101T000000_never\n-- UP\nCREATE TABLE b (id INTEGER);",
        );
        write(&f, "20240103T000000_c", "-- UP\nCREATE TABLE c (id INTEGER);");

        let err = f.runner.run_pending().unwrap_err();
        match &err {
            MigrationError::UnmetDependency { version, applied, .. } => {
                assert_eq!(version, "20240102T000000_b");
                assert_eq!(applied, &vec!["20240101T000000_a".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.outcome(), crate::error::OperationOutcome::PartialChange);
        assert!(!f.target.table_exists("c").unwrap());
    }

    #[test]
    fn test_failed_statement_rolls_back_and_records_failure() {
        let f = fixture();
        write(
            &f,
            "20240101T000000_bad",
            "-- UP\nCREATE TABLE half (id INTEGER);\nINSERT INTO nowhere VALUES (1);",
        );

        let err = f.runner.run_pending().unwrap_err();
        assert!(matches!(
            err,
            MigrationError::StatementExecutionFailed { statement_index: 1, .. }
        ));
        assert_eq!(err.outcome(), crate::error::OperationOutcome::NoChange);
        assert!(!f.target.table_exists("half").unwrap());

        let records = f.runner.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error_message.is_some());

        let status = f.runner.status().unwrap();
        assert_eq!(status.failed, vec!["20240101T000000_bad"]);
        assert_eq!(status.pending, vec!["20240101T000000_bad"]);
    }

    #[test]
    fn test_rollback_and_reapply() {
        let f = fixture();
        write(
            &f,
            "20240101T000000_users",
            "-- UP\nCREATE TABLE users (id INTEGER);\n-- DOWN\nDROP TABLE users;",
        );
        f.runner.run_pending().unwrap();
        f.runner.rollback("20240101T000000_users").unwrap();
        assert!(!f.target.table_exists("users").unwrap());

        assert!(f.runner.run_pending().unwrap().is_empty());
        assert_eq!(f.runner.status().unwrap().rolled_back, vec!["20240101T000000_users"]);

        f.runner.reapply("20240101T000000_users").unwrap();
        assert!(f.target.table_exists("users").unwrap());
        assert!(matches!(
            f.runner.reapply("20240101T000000_users"),
            Err(MigrationError::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_rollback_preconditions() {
        let f = fixture();
        write(&f, "20240101T000000_a", "-- UP\nCREATE TABLE a (id INTEGER);");
        assert!(matches!(
            f.runner.rollback("20240101T000000_a"),
            Err(MigrationError::NotApplied { .. })
        ));
        f.runner.run_pending().unwrap();
        assert!(matches!(
            f.runner.rollback("20240101T000000_a"),
            Err(MigrationError::NoRollbackScript { .. })
        ));
    }

    #[test]
    fn test_failed_rollback_changes_nothing() {
        let f = fixture();
        write(
            &f,
            "20240101T000000_a",
            "-- UP\nCREATE TABLE a (id INTEGER);\n-- DOWN\nDROP TABLE a;\nDROP TABLE missing;",
        );
        f.runner.run_pending().unwrap();
        assert!(matches!(
            f.runner.rollback("20240101T000000_a"),
            Err(MigrationError::RollbackFailed { statement_index: 1, .. })
        ));
        assert!(f.target.table_exists("a").unwrap());
        assert_eq!(f.runner.status().unwrap().applied, vec!["20240101T000000_a"]);
    }

    #[test]
    fn test_verify_integrity_reports_each_issue() {
        let f = fixture();
        write(&f, "20240101T000000_a", "-- UP\nCREATE TABLE a (id INTEGER);");
        write(&f, "20240102T000000_b", "-- UP\nCREATE TABLE b (id INTEGER);");
        write(&f, "20240103T000000_c", "-- UP\nCREATE TABLE c (id INTEGER);");
        f.runner.run_pending().unwrap();
        assert!(f.runner.verify_integrity().unwrap().is_empty());

        write(&f, "20240101T000000_a", "-- UP\nCREATE TABLE a (id INTEGER, x TEXT);");
        fs::remove_file(f.scripts.migrations_dir().join("20240102T000000_b.sql")).unwrap();
        write(&f, "20240103T000000_c", "no sections at all");

        let issues = f.runner.verify_integrity().unwrap();
        assert_eq!(issues.len(), 3);
        assert!(matches!(&issues[0], IntegrityIssue::ChecksumMismatch { version, .. } if version == "20240101T000000_a"));
        assert!(matches!(&issues[1], IntegrityIssue::MissingMigrationFile { version } if version == "20240102T000000_b"));
        assert!(matches!(&issues[2], IntegrityIssue::MalformedMigrationFile { version, .. } if version == "20240103T000000_c"));
    }

    #[test]
    fn test_generate_writes_parseable_file() {
        let f = fixture();
        let draft = MigrationDraft::new("Add Orders", "Orders table")
            .with_up("CREATE TABLE orders (id INTEGER);")
            .with_down("DROP TABLE orders;");
        let definition = f.runner.generate(draft).unwrap();
        assert!(definition.version.ends_with("_add_orders"));
        assert_eq!(definition.description, "Orders table");

        let catalog = f.runner.catalog().unwrap();
        assert_eq!(catalog.by_version(&definition.version), Some(&definition));
    }

    #[test]
    fn test_generate_without_body_yields_noop_migration() {
        let f = fixture();
        let definition = f.runner.generate(MigrationDraft::new("placeholder", "")).unwrap();
        assert!(!definition.up_script.is_empty());
        assert_eq!(f.runner.run_pending().unwrap().applied, vec![definition.version]);
    }
}
