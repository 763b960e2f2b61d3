//! Core error types.

use thiserror::Error;

/// Errors shared by every subsystem of the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Target store (SQLite) error.
    #[error("target store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Plan store (sled) error.
    #[error("plan store error: {0}")]
    Sled(#[from] sled::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A file or artifact that should exist does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether this error is a "file not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Whether an operation that failed left durable state behind.
///
/// Callers use this to tell "nothing happened" (preconditions unmet) apart
/// from "something happened but failed partway", which may itself need a
/// recovery plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// No state was mutated.
    NoChange,
    /// State was mutated before the failure; inspect the ledger.
    PartialChange,
}

impl std::fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationOutcome::NoChange => write!(f, "no_change"),
            OperationOutcome::PartialChange => write!(f, "partial_change"),
        }
    }
}
