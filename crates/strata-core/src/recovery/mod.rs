//! Recovery plans: templated, multi-step procedures that compose backups,
//! restores, migrations and validation checks.

pub mod error;
pub mod plan;
pub mod planner;
pub mod report;
pub mod store;

pub use error::RecoveryError;
pub use plan::{RecoveryPlan, RecoveryStep, RecoveryType, RiskLevel, StepType};
pub use planner::{NotificationHook, RecoveryPlanner, StepContext, ValidationHook};
pub use report::{ExecutionStatus, PlanExecutionReport, StepReport, StepStatus};
pub use store::RecoveryPlanStore;
