//! Backup and restore error types.

use crate::error::OperationOutcome;
use thiserror::Error;

/// Backup-specific errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// No metadata or artifact exists for the backup.
    #[error("backup {id} not found")]
    ArtifactNotFound {
        /// Backup id.
        id: String,
    },

    /// The backup did not complete and cannot be restored.
    #[error("backup {id} is {status}, not completed")]
    NotCompleted {
        /// Backup id.
        id: String,
        /// Its current status.
        status: String,
    },

    /// The artifact does not match its recorded checksum or cannot be decoded.
    #[error("backup {id} failed integrity check: {reason}")]
    IntegrityViolation {
        /// Backup id.
        id: String,
        /// What did not match.
        reason: String,
    },

    /// The pre-restore safety backup failed; the restore was not attempted.
    #[error("safety backup failed: {0}")]
    SafetyBackupFailed(String),

    /// The restore stopped partway through.
    #[error("restore stopped at table {failed_table} after restoring {restored:?}: {reason}")]
    PartialRestore {
        /// Tables restored before the failure.
        restored: Vec<String>,
        /// The table whose restore failed and was rolled back.
        failed_table: String,
        /// The underlying error.
        reason: String,
    },

    /// The request is inconsistent with the backup it names.
    #[error("invalid restore request: {0}")]
    InvalidRequest(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Whether the failure left the target store changed.
    pub fn outcome(&self) -> OperationOutcome {
        match self {
            BackupError::PartialRestore { restored, .. } if !restored.is_empty() => {
                OperationOutcome::PartialChange
            }
            _ => OperationOutcome::NoChange,
        }
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(e: rusqlite::Error) -> Self {
        BackupError::Storage(e.into())
    }
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Storage(e.into())
    }
}
