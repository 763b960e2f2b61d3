//! Strata Core - schema migrations, backups and recovery plans for a SQLite
//! target store.
//!
//! The [`Engine`] is the usual entry point. The components it wires together
//! ([`MigrationRunner`], [`BackupManager`], [`RecoveryPlanner`]) can also be
//! constructed directly.

pub mod backup;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod migration;
pub mod recovery;
pub mod store;
pub mod target;

pub use backup::{
    BackupError, BackupFilter, BackupManager, BackupMetadata, BackupStatus, BackupType, RestoreReport,
    RestoreRequest, RestoreType,
};
pub use checksum::{Blake3Checksum, ChecksumProvider, Sha256Checksum};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use error::{Error, OperationOutcome};
pub use migration::{
    IntegrityIssue, MigrationDefinition, MigrationDraft, MigrationError, MigrationHistory, MigrationRecord,
    MigrationRunner, MigrationStatusReport, RunReport,
};
pub use recovery::{
    ExecutionStatus, PlanExecutionReport, RecoveryError, RecoveryPlan, RecoveryPlanner, RecoveryType,
    RiskLevel,
};
pub use store::ScriptStore;
pub use target::TargetStore;
