//! Integration tests for recovery plans driven through the engine.

use serde_json::json;
use strata_core::recovery::{
    ExecutionStatus, NotificationHook, RecoveryError, RecoveryPlanStore, RecoveryType, StepContext, StepStatus, ValidationHook,
};
use strata_core::{BackupType, Engine, EngineConfig, OperationOutcome, TargetStore};

struct TestContext {
    engine: Engine,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine
            .target()
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT);
                     INSERT INTO events VALUES (1, 'signup'), (2, 'login');",
                )
            })
            .unwrap();
        Self { engine, _dir: dir }
    }

    fn events(&self) -> u64 {
        self.engine.target().row_count("events").unwrap()
    }
}

fn check<F>(f: F) -> Box<dyn ValidationHook>
where
    F: Fn(&TargetStore, &StepContext<'_>) -> Result<serde_json::Value, String> + Send + Sync + 'static,
{
    Box::new(f)
}

fn notifier<F>(f: F) -> Box<dyn NotificationHook>
where
    F: Fn(&StepContext<'_>, &str) -> Result<(), String> + Send + Sync + 'static,
{
    Box::new(f)
}

#[test]
fn test_critical_failure_stops_before_later_steps() {
    let mut ctx = TestContext::new();
    ctx.engine
        .recovery_mut()
        .register_validation_hook("assess", check(|_, _| Err("store unreachable".to_string())));

    let plan = ctx
        .engine
        .create_recovery_plan("outage", "primary lost", RecoveryType::Disaster)
        .unwrap();
    let err = ctx.engine.execute_recovery_plan(&plan.id).unwrap_err();

    assert!(matches!(err, RecoveryError::CriticalStepFailed { ref step, .. } if step == "assess"));
    assert_eq!(err.outcome(), OperationOutcome::NoChange);
    // The pre-recovery backup never ran.
    assert!(ctx
        .engine
        .list_backups(&strata_core::BackupFilter::all())
        .unwrap()
        .is_empty());

    let report = ctx.engine.last_recovery_execution(&plan.id).unwrap().unwrap();
    assert_eq!(report.status, ExecutionStatus::Aborted);
    assert!(report
        .steps
        .iter()
        .skip(1)
        .all(|s| s.status == StepStatus::Skipped));
}

#[test]
fn test_non_critical_failure_completes_plan() {
    let mut ctx = TestContext::new();
    ctx.engine.create_backup(BackupType::Full, Some("nightly")).unwrap();
    ctx.engine
        .target()
        .with_connection(|conn| conn.execute("DELETE FROM events", []))
        .unwrap();
    ctx.engine.recovery_mut().set_notification_hook(notifier(|_, _| Err("webhook returned 503".to_string())));

    let plan = ctx
        .engine
        .create_recovery_plan("outage", "", RecoveryType::Disaster)
        .unwrap();
    let report = ctx.engine.execute_recovery_plan(&plan.id).unwrap();

    assert_eq!(report.status, ExecutionStatus::CompletedWithFailures);
    assert_eq!(report.failed_steps(), vec!["notify_operators"]);
    assert_eq!(
        report.step("notify_operators").unwrap().error.as_deref(),
        Some("webhook returned 503")
    );
    assert_eq!(ctx.events(), 2);
}

#[test]
fn test_plans_are_listed_and_persisted() {
    let ctx = TestContext::new();
    let created: Vec<String> = RecoveryType::ALL
        .into_iter()
        .map(|t| ctx.engine.create_recovery_plan(t.as_str(), "", t).unwrap().id)
        .collect();

    let listed: Vec<String> = ctx
        .engine
        .list_recovery_plans()
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(listed, created);

    let migration = ctx.engine.get_recovery_plan(&created[3]).unwrap();
    assert_eq!(migration.recovery_type, RecoveryType::Migration);
    assert_eq!(migration.steps[0].id, "pre_migration_backup");
}

#[test]
fn test_stored_plan_with_placeholder_parameters_loads() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let raw = json!({
        "id": "plan_legacy",
        "name": "legacy",
        "description": "written by older tooling",
        "recovery_type": "corruption",
        "steps": [{
            "id": "identify_corrupted_tables",
            "name": "identify corrupted tables",
            "type": "validation",
            "description": "",
            "parameters": "[object Object]",
            "dependencies": [],
            "timeout_seconds": 900,
            "retry_attempts": 1,
            "critical": true
        }],
        "estimated_time_minutes": 60,
        "risk_level": "medium",
        "prerequisites": [],
        "rollback_plan": [],
        "created_at": "2024-05-01T12:00:00Z",
        "updated_at": "2024-05-01T12:00:00Z"
    });
    db.open_tree(RecoveryPlanStore::TREE_NAME)
        .unwrap()
        .insert("plan:plan_legacy", serde_json::to_vec(&raw).unwrap())
        .unwrap();

    let store = RecoveryPlanStore::open(&db).unwrap();
    let plan = store.load_plan("plan_legacy").unwrap().unwrap();
    assert!(plan.steps[0].parameters.is_empty());
    assert_eq!(plan.recovery_type, RecoveryType::Corruption);
}
