//! Migration-specific error types.

use crate::error::OperationOutcome;
use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration file could not be parsed.
    #[error("malformed migration {file}: {reason}")]
    Malformed {
        /// The offending file.
        file: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A pending migration depends on a version that is not applied.
    #[error("migration {version} depends on {dependency}, which is not applied")]
    UnmetDependency {
        /// The migration that could not run.
        version: String,
        /// The missing dependency.
        dependency: String,
        /// Versions applied earlier in the same run.
        applied: Vec<String>,
    },

    /// A statement inside a migration failed; its transaction was rolled back.
    #[error("migration {version} failed at statement {statement_index}: {message}")]
    StatementExecutionFailed {
        /// The migration being applied.
        version: String,
        /// Zero-based index of the failing statement.
        statement_index: usize,
        /// The failing statement.
        statement: String,
        /// The store's error message.
        message: String,
        /// Versions applied earlier in the same run.
        applied: Vec<String>,
    },

    /// Rollback requested for a version with no successful record.
    #[error("migration {version} is not applied")]
    NotApplied {
        /// The requested version.
        version: String,
    },

    /// Rollback requested for a version whose record has no down script.
    #[error("migration {version} has no rollback script")]
    NoRollbackScript {
        /// The requested version.
        version: String,
    },

    /// A rollback statement failed; nothing was changed.
    #[error("rollback of {version} failed at statement {statement_index}: {message}")]
    RollbackFailed {
        /// The version being rolled back.
        version: String,
        /// Zero-based index of the failing statement.
        statement_index: usize,
        /// The store's error message.
        message: String,
    },

    /// No migration definition exists for the version.
    #[error("migration {version} not found")]
    NotFound {
        /// The requested version.
        version: String,
    },

    /// A successful record for this version already exists.
    #[error("migration {version} is already applied")]
    AlreadyApplied {
        /// The version.
        version: String,
    },

    /// A migration file with this version already exists.
    #[error("migration file {file} already exists")]
    AlreadyExists {
        /// The file name.
        file: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl MigrationError {
    /// Whether the failure left the store changed.
    ///
    /// A failed statement rolls back its own migration, but migrations applied
    /// earlier in the same run stay applied.
    pub fn outcome(&self) -> OperationOutcome {
        match self {
            MigrationError::UnmetDependency { applied, .. }
            | MigrationError::StatementExecutionFailed { applied, .. }
                if !applied.is_empty() =>
            {
                OperationOutcome::PartialChange
            }
            _ => OperationOutcome::NoChange,
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        MigrationError::Storage(e.into())
    }
}
