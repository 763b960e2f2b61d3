//! Recovery planner error types.

use crate::error::OperationOutcome;
use thiserror::Error;

/// Recovery-specific errors.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No plan is stored under the id.
    #[error("recovery plan {id} not found")]
    PlanNotFound {
        /// Plan id.
        id: String,
    },

    /// A critical step failed after exhausting its retries; later steps were
    /// not executed.
    #[error("critical step {step} of plan {plan_id} failed after {attempts} attempt(s): {reason}")]
    CriticalStepFailed {
        /// Plan id.
        plan_id: String,
        /// Failing step id.
        step: String,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        reason: String,
        /// Whether an earlier step already changed the target store.
        store_changed: bool,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl RecoveryError {
    /// Whether the failure left the target store changed.
    pub fn outcome(&self) -> OperationOutcome {
        match self {
            RecoveryError::CriticalStepFailed {
                store_changed: true, ..
            } => OperationOutcome::PartialChange,
            _ => OperationOutcome::NoChange,
        }
    }
}

impl From<sled::Error> for RecoveryError {
    fn from(e: sled::Error) -> Self {
        RecoveryError::Storage(e.into())
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(e: serde_json::Error) -> Self {
        RecoveryError::Storage(e.into())
    }
}
