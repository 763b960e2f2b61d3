//! The operational surface: one [`Engine`] wires the migration runner, backup
//! manager and recovery planner to a single target store and storage root.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::backup::{
    BackupError, BackupFilter, BackupManager, BackupMetadata, BackupType, RestoreReport, RestoreRequest,
};
use crate::config::EngineConfig;
use crate::error::{Error, OperationOutcome};
use crate::migration::{
    IntegrityIssue, MigrationDefinition, MigrationDraft, MigrationError, MigrationHistory, MigrationRecord,
    MigrationRunner, MigrationStatusReport, RunReport,
};
use crate::recovery::{
    PlanExecutionReport, RecoveryError, RecoveryPlan, RecoveryPlanStore, RecoveryPlanner, RecoveryType,
};
use crate::store::ScriptStore;
use crate::target::TargetStore;

/// Any error an engine operation can return.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Storage(#[from] Error),
}

impl EngineError {
    /// Whether the failed operation left state behind.
    pub fn outcome(&self) -> OperationOutcome {
        match self {
            EngineError::Migration(e) => e.outcome(),
            EngineError::Backup(e) => e.outcome(),
            EngineError::Recovery(e) => e.outcome(),
            EngineError::Storage(_) => OperationOutcome::NoChange,
        }
    }

    /// Whether the failure was an unmet precondition that changed nothing.
    pub fn is_precondition(&self) -> bool {
        match self {
            EngineError::Migration(e) => matches!(
                e,
                MigrationError::UnmetDependency { .. }
                    | MigrationError::NotApplied { .. }
                    | MigrationError::NoRollbackScript { .. }
                    | MigrationError::NotFound { .. }
                    | MigrationError::AlreadyApplied { .. }
                    | MigrationError::AlreadyExists { .. }
                    | MigrationError::Malformed { .. }
            ) && e.outcome() == OperationOutcome::NoChange,
            EngineError::Backup(e) => matches!(
                e,
                BackupError::ArtifactNotFound { .. }
                    | BackupError::NotCompleted { .. }
                    | BackupError::IntegrityViolation { .. }
                    | BackupError::SafetyBackupFailed(_)
                    | BackupError::InvalidRequest(_)
            ),
            EngineError::Recovery(e) => matches!(
                e,
                RecoveryError::PlanNotFound { .. } | RecoveryError::CriticalStepFailed { .. }
            ) && e.outcome() == OperationOutcome::NoChange,
            EngineError::Storage(_) => false,
        }
    }
}

/// Migration, backup and recovery orchestration over one target store.
pub struct Engine {
    config: Arc<EngineConfig>,
    target: Arc<TargetStore>,
    runner: Arc<MigrationRunner>,
    backups: Arc<BackupManager>,
    planner: RecoveryPlanner,
}

impl Engine {
    /// Open the target store and storage root described by `config`,
    /// creating directories and the ledger table as needed.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let target = Arc::new(TargetStore::from_config(&config)?);
        let scripts = ScriptStore::from_config(&config);
        scripts.ensure_dirs()?;

        let runner = Arc::new(MigrationRunner::new(
            Arc::clone(&target),
            scripts.clone(),
            MigrationHistory::new(config.history_table.clone()),
        )?);
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&target),
            scripts,
            Arc::clone(&config),
        ));

        let db = sled::open(config.recovery_dir()).map_err(Error::from)?;
        let store = RecoveryPlanStore::open(&db)?;
        let planner = RecoveryPlanner::new(
            Arc::clone(&target),
            Arc::clone(&runner),
            Arc::clone(&backups),
            store,
        )
        .with_retry_backoff(config.retry_backoff);

        info!(
            root = %config.storage_root.display(),
            database = %config.database_path.display(),
            "engine opened"
        );
        Ok(Self {
            config,
            target,
            runner,
            backups,
            planner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn target(&self) -> &TargetStore {
        &self.target
    }

    /// The recovery planner, for registering validation and notification hooks.
    pub fn recovery_mut(&mut self) -> &mut RecoveryPlanner {
        &mut self.planner
    }

    // Migrations

    pub fn status(&self) -> Result<MigrationStatusReport, MigrationError> {
        self.runner.status()
    }

    pub fn history(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.runner.records()
    }

    pub fn migrate(&self) -> Result<RunReport, MigrationError> {
        self.runner.run_pending()
    }

    pub fn rollback(&self, version: &str) -> Result<(), MigrationError> {
        self.runner.rollback(version)
    }

    pub fn reapply(&self, version: &str) -> Result<(), MigrationError> {
        self.runner.reapply(version)
    }

    pub fn generate(&self, draft: MigrationDraft) -> Result<MigrationDefinition, MigrationError> {
        self.runner.generate(draft)
    }

    pub fn verify(&self) -> Result<Vec<IntegrityIssue>, MigrationError> {
        self.runner.verify_integrity()
    }

    // Backups

    pub fn create_backup(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
    ) -> Result<BackupMetadata, BackupError> {
        self.backups.create_backup(backup_type, description)
    }

    pub fn get_backup(&self, id: &str) -> Result<BackupMetadata, BackupError> {
        self.backups.get_backup(id)
    }

    pub fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>, BackupError> {
        self.backups.list_backups(filter)
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport, BackupError> {
        self.backups.restore(request)
    }

    /// Remove expired backups, using the configured retention unless
    /// `retention_days` overrides it.
    pub fn cleanup_expired(&self, retention_days: Option<u32>) -> Result<Vec<String>, BackupError> {
        self.backups
            .cleanup_expired(retention_days.unwrap_or(self.config.retention_days))
    }

    // Recovery

    pub fn create_recovery_plan(
        &self,
        name: &str,
        description: &str,
        recovery_type: RecoveryType,
    ) -> Result<RecoveryPlan, RecoveryError> {
        self.planner.create_plan(name, description, recovery_type)
    }

    pub fn create_point_in_time_plan(
        &self,
        name: &str,
        description: &str,
        target_time: DateTime<Utc>,
    ) -> Result<RecoveryPlan, RecoveryError> {
        self.planner
            .create_point_in_time_plan(name, description, target_time)
    }

    pub fn get_recovery_plan(&self, id: &str) -> Result<RecoveryPlan, RecoveryError> {
        self.planner.get_plan(id)
    }

    pub fn list_recovery_plans(&self) -> Result<Vec<RecoveryPlan>, RecoveryError> {
        self.planner.list_plans()
    }

    pub fn delete_recovery_plan(&self, id: &str) -> Result<(), RecoveryError> {
        self.planner.delete_plan(id)
    }

    pub fn execute_recovery_plan(&self, plan_id: &str) -> Result<PlanExecutionReport, RecoveryError> {
        self.planner.execute_plan(plan_id)
    }

    pub fn last_recovery_execution(
        &self,
        plan_id: &str,
    ) -> Result<Option<PlanExecutionReport>, RecoveryError> {
        self.planner.last_execution(plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

        assert!(dir.path().join("migrations").is_dir());
        assert!(dir.path().join("backups").is_dir());
        assert!(dir.path().join("recovery").exists());
        assert!(engine.target().table_exists("schema_migrations").unwrap());
        assert!(engine.status().unwrap().applied.is_empty());
    }

    #[test]
    fn test_error_classification() {
        let unmet: EngineError = MigrationError::NotApplied {
            version: "20240101T000000_x".into(),
        }
        .into();
        assert!(unmet.is_precondition());
        assert_eq!(unmet.outcome(), OperationOutcome::NoChange);

        let partial: EngineError = BackupError::PartialRestore {
            restored: vec!["users".into()],
            failed_table: "orders".into(),
            reason: "constraint failed".into(),
        }
        .into();
        assert!(!partial.is_precondition());
        assert_eq!(partial.outcome(), OperationOutcome::PartialChange);

        let io: EngineError = Error::InvalidData("bad".into()).into();
        assert!(!io.is_precondition());
    }
}
