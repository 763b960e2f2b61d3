//! Outcomes of recovery plan executions.

use super::plan::StepType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Not run because an earlier critical step failed.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Report for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error, for failed steps.
    pub error: Option<String>,
    /// Step-specific output (backup id, restored tables, applied versions).
    #[serde(default)]
    pub output: Value,
    /// Whether the step changed the target store, including partway through
    /// a failed attempt.
    #[serde(default)]
    pub store_changed: bool,
}

impl StepReport {
    pub(crate) fn skipped(step_id: &str, step_type: StepType) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_type,
            status: StepStatus::Skipped,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            output: Value::Null,
            store_changed: false,
        }
    }

    /// Whether the step ran to success.
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Overall outcome of a plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every step succeeded.
    Completed,
    /// Only non-critical steps failed.
    CompletedWithFailures,
    /// A critical step failed and the remaining steps were skipped.
    Aborted,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::CompletedWithFailures => write!(f, "completed_with_failures"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Persisted record of one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecutionReport {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
}

impl PlanExecutionReport {
    /// Report for a step, by id.
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    /// Whether any step changed the target store.
    pub fn store_changed(&self) -> bool {
        self.steps.iter().any(|s| s.store_changed)
    }

    /// Ids of steps that failed.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id.as_str())
            .collect()
    }
}
