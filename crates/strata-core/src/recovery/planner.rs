//! Recovery plan creation and execution.
//!
//! A plan runs its steps in list order. Backup and restore steps go to the
//! [`BackupManager`], migration steps to the [`MigrationRunner`], validation
//! and notification steps to caller-supplied hooks or the built-in checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use super::error::RecoveryError;
use super::plan::{plan_id, RecoveryPlan, RecoveryStep, RecoveryType, StepType};
use super::report::{ExecutionStatus, PlanExecutionReport, StepReport, StepStatus};
use super::store::RecoveryPlanStore;
use crate::backup::{BackupManager, BackupType, RestoreRequest, RestoreType};
use crate::error::OperationOutcome;
use crate::migration::MigrationRunner;
use crate::target::{quote_ident, TargetStore};

/// What a step executor sees while running one attempt.
#[derive(Debug)]
pub struct StepContext<'a> {
    pub plan_id: &'a str,
    pub step: &'a RecoveryStep,
    /// One-based attempt number.
    pub attempt: u32,
    /// The step's time budget. Executors are expected to honour it; it is
    /// not enforced.
    pub timeout: Duration,
    /// When the plan execution began.
    pub execution_started: DateTime<Utc>,
    /// Outputs of the steps that succeeded so far, by step id.
    pub outputs: &'a HashMap<String, Value>,
}

/// Caller-supplied validation check, registered under a check name.
pub trait ValidationHook: Send + Sync {
    /// Run the check. The returned value becomes the step's output.
    fn validate(&self, target: &TargetStore, ctx: &StepContext<'_>) -> Result<Value, String>;
}

impl<F> ValidationHook for F
where
    F: Fn(&TargetStore, &StepContext<'_>) -> Result<Value, String> + Send + Sync,
{
    fn validate(&self, target: &TargetStore, ctx: &StepContext<'_>) -> Result<Value, String> {
        self(target, ctx)
    }
}

/// Caller-supplied delivery of plan notifications.
pub trait NotificationHook: Send + Sync {
    fn notify(&self, ctx: &StepContext<'_>, message: &str) -> Result<(), String>;
}

impl<F> NotificationHook for F
where
    F: Fn(&StepContext<'_>, &str) -> Result<(), String> + Send + Sync,
{
    fn notify(&self, ctx: &StepContext<'_>, message: &str) -> Result<(), String> {
        self(ctx, message)
    }
}

struct StepFailure {
    message: String,
    store_changed: bool,
}

impl StepFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            store_changed: false,
        }
    }

    fn with_outcome(message: impl Into<String>, outcome: OperationOutcome) -> Self {
        Self {
            message: message.into(),
            store_changed: outcome == OperationOutcome::PartialChange,
        }
    }
}

/// Builds, stores and executes recovery plans.
pub struct RecoveryPlanner {
    target: Arc<TargetStore>,
    runner: Arc<MigrationRunner>,
    backups: Arc<BackupManager>,
    store: RecoveryPlanStore,
    retry_backoff: Option<Duration>,
    validation_hooks: HashMap<String, Box<dyn ValidationHook>>,
    notification_hook: Option<Box<dyn NotificationHook>>,
}

impl RecoveryPlanner {
    /// Create a planner over the given components.
    pub fn new(
        target: Arc<TargetStore>,
        runner: Arc<MigrationRunner>,
        backups: Arc<BackupManager>,
        store: RecoveryPlanStore,
    ) -> Self {
        Self {
            target,
            runner,
            backups,
            store,
            retry_backoff: None,
            validation_hooks: HashMap::new(),
            notification_hook: None,
        }
    }

    /// Wait between retries, starting at `base` and doubling per attempt.
    pub fn with_retry_backoff(mut self, base: Option<Duration>) -> Self {
        self.retry_backoff = base;
        self
    }

    /// Override a validation check (`assess`, `integrity_check`,
    /// `identify_corrupted_tables`, `verify_migrations`, or a custom name).
    pub fn register_validation_hook(&mut self, check: impl Into<String>, hook: Box<dyn ValidationHook>) {
        self.validation_hooks.insert(check.into(), hook);
    }

    /// Deliver notifications through `hook` instead of the log.
    pub fn set_notification_hook(&mut self, hook: Box<dyn NotificationHook>) {
        self.notification_hook = Some(hook);
    }

    /// Create and persist a plan from the template of `recovery_type`.
    pub fn create_plan(
        &self,
        name: &str,
        description: &str,
        recovery_type: RecoveryType,
    ) -> Result<RecoveryPlan, RecoveryError> {
        let mut plan = RecoveryPlan::from_template(name, description, recovery_type, Utc::now());
        plan.id = self.unique_plan_id(plan.created_at)?;
        self.store.save_plan(&plan)?;
        self.store.flush()?;
        info!(plan_id = %plan.id, recovery_type = %recovery_type, steps = plan.steps.len(), "recovery plan created");
        Ok(plan)
    }

    /// Create a point-in-time plan restoring the newest backup taken before
    /// `target_time`.
    pub fn create_point_in_time_plan(
        &self,
        name: &str,
        description: &str,
        target_time: DateTime<Utc>,
    ) -> Result<RecoveryPlan, RecoveryError> {
        let mut plan = RecoveryPlan::from_template(name, description, RecoveryType::PointInTime, Utc::now());
        plan.id = self.unique_plan_id(plan.created_at)?;
        if let Some(step) = plan.step_mut("restore_point_in_time") {
            step.parameters
                .insert("before".to_string(), Value::String(target_time.to_rfc3339()));
        }
        self.store.save_plan(&plan)?;
        self.store.flush()?;
        info!(plan_id = %plan.id, target_time = %target_time, "point-in-time recovery plan created");
        Ok(plan)
    }

    fn unique_plan_id(&self, now: DateTime<Utc>) -> Result<String, RecoveryError> {
        let base = plan_id(now);
        let mut id = base.clone();
        let mut n = 1;
        while self.store.load_plan(&id)?.is_some() {
            id = format!("{}_{}", base, n);
            n += 1;
        }
        Ok(id)
    }

    /// Load a plan.
    pub fn get_plan(&self, id: &str) -> Result<RecoveryPlan, RecoveryError> {
        self.store
            .load_plan(id)?
            .ok_or_else(|| RecoveryError::PlanNotFound { id: id.to_string() })
    }

    /// Every stored plan, oldest first.
    pub fn list_plans(&self) -> Result<Vec<RecoveryPlan>, RecoveryError> {
        self.store.list_plans()
    }

    /// Remove a plan together with its last execution report.
    pub fn delete_plan(&self, id: &str) -> Result<(), RecoveryError> {
        if !self.store.delete_plan(id)? {
            return Err(RecoveryError::PlanNotFound { id: id.to_string() });
        }
        info!(plan_id = id, "recovery plan deleted");
        Ok(())
    }

    /// The report of the plan's most recent execution.
    pub fn last_execution(&self, plan_id: &str) -> Result<Option<PlanExecutionReport>, RecoveryError> {
        self.store.load_execution(plan_id)
    }

    /// Execute a stored plan.
    ///
    /// Steps run in list order. A failing step is retried up to its
    /// `retry_attempts`; if it still fails and is critical, the remaining
    /// steps are skipped and `CriticalStepFailed` is returned. Non-critical
    /// failures are recorded and execution continues. The execution report
    /// is persisted in every case.
    #[instrument(skip(self))]
    pub fn execute_plan(&self, plan_id: &str) -> Result<PlanExecutionReport, RecoveryError> {
        let plan = self.get_plan(plan_id)?;
        let started_at = Utc::now();
        info!(recovery_type = %plan.recovery_type, steps = plan.steps.len(), "executing recovery plan");

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut steps: Vec<StepReport> = Vec::with_capacity(plan.steps.len());
        let mut aborted: Option<(String, u32, String)> = None;

        for step in &plan.steps {
            if aborted.is_some() {
                steps.push(StepReport::skipped(&step.id, step.step_type));
                continue;
            }

            let report = self.run_step(&plan, step, started_at, &outputs, &steps);
            match report.status {
                StepStatus::Succeeded => {
                    outputs.insert(step.id.clone(), report.output.clone());
                }
                _ if step.critical => {
                    error!(step = %step.id, attempts = report.attempts, "critical recovery step failed");
                    aborted = Some((
                        step.id.clone(),
                        report.attempts,
                        report.error.clone().unwrap_or_default(),
                    ));
                }
                _ => {
                    warn!(step = %step.id, attempts = report.attempts, "non-critical recovery step failed");
                }
            }
            steps.push(report);
        }

        let status = if aborted.is_some() {
            ExecutionStatus::Aborted
        } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
            ExecutionStatus::CompletedWithFailures
        } else {
            ExecutionStatus::Completed
        };
        let report = PlanExecutionReport {
            plan_id: plan.id.clone(),
            status,
            started_at,
            completed_at: Utc::now(),
            steps,
        };
        self.store.save_execution(&report)?;
        self.store.flush()?;

        if let Some((step, attempts, reason)) = aborted {
            return Err(RecoveryError::CriticalStepFailed {
                plan_id: plan.id,
                step,
                attempts,
                reason,
                store_changed: report.store_changed(),
            });
        }
        info!(status = %report.status, "recovery plan finished");
        Ok(report)
    }

    fn run_step(
        &self,
        plan: &RecoveryPlan,
        step: &RecoveryStep,
        execution_started: DateTime<Utc>,
        outputs: &HashMap<String, Value>,
        earlier: &[StepReport],
    ) -> StepReport {
        let started_at = Utc::now();
        let max_attempts = step.retry_attempts.saturating_add(1);
        let mut store_changed = false;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                if let Some(base) = self.retry_backoff {
                    let delay = base.saturating_mul(1u32 << (attempt - 2).min(16));
                    debug!(step = %step.id, delay_ms = delay.as_millis() as u64, "waiting before retry");
                    std::thread::sleep(delay);
                }
            }

            let ctx = StepContext {
                plan_id: &plan.id,
                step,
                attempt,
                timeout: Duration::from_secs(step.timeout_seconds),
                execution_started,
                outputs,
            };
            let timer = Instant::now();
            let result = self.dispatch(&ctx, earlier);
            if timer.elapsed() > ctx.timeout {
                warn!(step = %step.id, elapsed_ms = timer.elapsed().as_millis() as u64, "step exceeded its timeout");
            }

            match result {
                Ok(output) => {
                    info!(step = %step.id, attempt, "recovery step succeeded");
                    return StepReport {
                        step_id: step.id.clone(),
                        step_type: step.step_type,
                        status: StepStatus::Succeeded,
                        attempts: attempt,
                        started_at: Some(started_at),
                        completed_at: Some(Utc::now()),
                        error: None,
                        output,
                        store_changed: store_changed || step.step_type.mutates_store(),
                    };
                }
                Err(failure) => {
                    warn!(step = %step.id, attempt, max_attempts, error = %failure.message, "recovery step attempt failed");
                    store_changed |= failure.store_changed;
                    last_error = failure.message;
                }
            }
        }

        StepReport {
            step_id: step.id.clone(),
            step_type: step.step_type,
            status: StepStatus::Failed,
            attempts: max_attempts,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            error: Some(last_error),
            output: Value::Null,
            store_changed,
        }
    }

    fn dispatch(&self, ctx: &StepContext<'_>, earlier: &[StepReport]) -> Result<Value, StepFailure> {
        match ctx.step.step_type {
            StepType::Backup => self.backup_step(ctx),
            StepType::Restore => self.restore_step(ctx),
            StepType::Migration => self.migration_step(ctx),
            StepType::Validation => self.validation_step(ctx),
            StepType::Notification => self.notification_step(ctx, earlier),
        }
    }

    fn backup_step(&self, ctx: &StepContext<'_>) -> Result<Value, StepFailure> {
        let backup_type = match ctx.step.param_str("backup_type") {
            Some(s) => s.parse::<BackupType>().map_err(StepFailure::new)?,
            None => BackupType::Full,
        };
        let description = ctx
            .step
            .param_str("description")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} ({})", ctx.step.id, ctx.plan_id));

        let metadata = self
            .backups
            .create_backup(backup_type, Some(&description))
            .map_err(|e| StepFailure::with_outcome(e.to_string(), e.outcome()))?;
        Ok(json!({ "backup_id": metadata.id }))
    }

    fn restore_step(&self, ctx: &StepContext<'_>) -> Result<Value, StepFailure> {
        let restore_type = match ctx.step.param_str("restore_type") {
            Some(s) => s.parse::<RestoreType>().map_err(StepFailure::new)?,
            None => RestoreType::Full,
        };

        // Only backups older than this execution, so the plan never restores
        // its own pre-recovery backup.
        let mut before = ctx.execution_started;
        if let Some(raw) = ctx.step.param_str("before") {
            let target = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| StepFailure::new(format!("invalid before parameter {:?}: {}", raw, e)))?
                .with_timezone(&Utc);
            before = before.min(target);
        }

        let tables = if restore_type == RestoreType::Selective {
            let tables = Self::selected_tables(ctx);
            if tables.is_empty() {
                info!(step = %ctx.step.id, "no tables selected, nothing to restore");
                return Ok(json!({ "restored_tables": [], "rows_restored": 0 }));
            }
            tables
        } else {
            Vec::new()
        };

        let backup = self
            .backups
            .latest_completed(&[BackupType::Full, BackupType::Manual], Some(before))
            .map_err(|e| StepFailure::new(e.to_string()))?
            .ok_or_else(|| StepFailure::new(format!("no completed full backup started before {}", before)))?;

        let request = match restore_type {
            RestoreType::Selective => RestoreRequest::selective(backup.id.clone(), tables),
            _ => RestoreRequest::new(backup.id.clone(), restore_type),
        };
        let request = request.with_validation(true).with_safety_backup(false);

        let report = self
            .backups
            .restore(&request)
            .map_err(|e| StepFailure::with_outcome(e.to_string(), e.outcome()))?;
        Ok(json!({
            "backup_id": report.backup_id,
            "restored_tables": report.restored_tables,
            "rows_restored": report.rows_restored,
        }))
    }

    fn selected_tables(ctx: &StepContext<'_>) -> Vec<String> {
        let source = ctx.step.param_str("tables_from").unwrap_or("identify_corrupted_tables");
        ctx.outputs
            .get(source)
            .and_then(|output| output.get("tables"))
            .and_then(Value::as_array)
            .map(|tables| {
                tables
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn migration_step(&self, ctx: &StepContext<'_>) -> Result<Value, StepFailure> {
        match ctx.step.param_str("action").unwrap_or("run_pending") {
            "run_pending" => {
                let report = self
                    .runner
                    .run_pending()
                    .map_err(|e| StepFailure::with_outcome(e.to_string(), e.outcome()))?;
                Ok(json!({ "applied": report.applied, "skipped": report.skipped }))
            }
            other => Err(StepFailure::new(format!("unknown migration action {}", other))),
        }
    }

    fn validation_step(&self, ctx: &StepContext<'_>) -> Result<Value, StepFailure> {
        let check = ctx.step.param_str("check").unwrap_or(&ctx.step.id);
        if let Some(hook) = self.validation_hooks.get(check) {
            return hook.validate(&self.target, ctx).map_err(StepFailure::new);
        }
        self.builtin_check(check).map_err(StepFailure::new)
    }

    fn builtin_check(&self, check: &str) -> Result<Value, String> {
        match check {
            "assess" => {
                let tables = self.target.list_tables().map_err(|e| e.to_string())?;
                Ok(json!({ "table_count": tables.len(), "tables": tables }))
            }
            "integrity_check" | "verify_integrity" => {
                let result: String = self
                    .target
                    .with_connection(|conn| conn.query_row("PRAGMA integrity_check", [], |row| row.get(0)))
                    .map_err(|e| e.to_string())?;
                if result == "ok" {
                    Ok(json!({ "integrity_check": result }))
                } else {
                    Err(format!("integrity check failed: {}", result))
                }
            }
            "identify_corrupted_tables" => {
                let tables = self.target.list_tables().map_err(|e| e.to_string())?;
                let corrupted: Vec<String> = tables
                    .into_iter()
                    .filter(|table| {
                        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
                        self.target
                            .with_connection(|conn| conn.query_row(&sql, [], |row| row.get::<_, i64>(0)))
                            .is_err()
                    })
                    .collect();
                if !corrupted.is_empty() {
                    warn!(tables = ?corrupted, "corrupted tables found");
                }
                Ok(json!({ "tables": corrupted }))
            }
            "verify_migrations" | "verify_migration_files" => {
                let issues = self.runner.verify_integrity().map_err(|e| e.to_string())?;
                if issues.is_empty() {
                    Ok(json!({ "issues": [] }))
                } else {
                    let listed: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                    Err(format!("migration integrity issues: {}", listed.join("; ")))
                }
            }
            other => Err(format!("no validation check named {}", other)),
        }
    }

    fn notification_step(&self, ctx: &StepContext<'_>, earlier: &[StepReport]) -> Result<Value, StepFailure> {
        let failed: Vec<&str> = earlier
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id.as_str())
            .collect();
        let message = if failed.is_empty() {
            format!("recovery plan {}: {} step(s) succeeded", ctx.plan_id, earlier.len())
        } else {
            format!(
                "recovery plan {}: {} step(s) run, failed: {}",
                ctx.plan_id,
                earlier.len(),
                failed.join(", ")
            )
        };

        match &self.notification_hook {
            Some(hook) => hook.notify(ctx, &message).map_err(StepFailure::new)?,
            None => info!(channel = ctx.step.param_str("channel").unwrap_or("log"), "{}", message),
        }
        Ok(json!({ "message": message }))
    }
}
