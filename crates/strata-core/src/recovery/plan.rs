//! Recovery plans and their step templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// Kind of incident a plan recovers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    Disaster,
    Corruption,
    PointInTime,
    Migration,
}

impl RecoveryType {
    pub const ALL: [RecoveryType; 4] = [
        RecoveryType::Disaster,
        RecoveryType::Corruption,
        RecoveryType::PointInTime,
        RecoveryType::Migration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryType::Disaster => "disaster",
            RecoveryType::Corruption => "corruption",
            RecoveryType::PointInTime => "point_in_time",
            RecoveryType::Migration => "migration",
        }
    }
}

impl std::fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecoveryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown recovery type: {}", s))
    }
}

/// Risk of executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Backup,
    Restore,
    Migration,
    Validation,
    Notification,
}

impl StepType {
    /// Whether a successful step of this type changes the target store.
    pub fn mutates_store(&self) -> bool {
        matches!(self, StepType::Restore | StepType::Migration)
    }
}

/// One step of a recovery plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// Unique within the plan.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub description: String,
    #[serde(default, deserialize_with = "parameters_or_empty")]
    pub parameters: Map<String, Value>,
    /// Ids of steps this one depends on. Execution follows list order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub critical: bool,
}

impl RecoveryStep {
    /// String parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Decode a step's `parameters`, treating placeholder values as empty.
///
/// Plans written by older tooling store a non-object placeholder here (the
/// string `"[object Object]"`, an empty string or `null`). A string holding
/// an encoded JSON object is decoded.
fn parameters_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        Value::String(s) => Ok(serde_json::from_str(&s).unwrap_or_default()),
        Value::Null => Ok(Map::new()),
        other => Err(serde::de::Error::custom(format!(
            "step parameters must be an object, got {}",
            other
        ))),
    }
}

/// A structured, multi-step recovery procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub recovery_type: RecoveryType,
    pub steps: Vec<RecoveryStep>,
    pub estimated_time_minutes: u32,
    pub risk_level: RiskLevel,
    pub prerequisites: Vec<String>,
    /// Human-readable actions that undo the plan.
    pub rollback_plan: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryPlan {
    /// Build a plan from the template of its recovery type.
    pub fn from_template(
        name: impl Into<String>,
        description: impl Into<String>,
        recovery_type: RecoveryType,
        now: DateTime<Utc>,
    ) -> Self {
        let profile = profile(recovery_type);
        Self {
            id: plan_id(now),
            name: name.into(),
            description: description.into(),
            recovery_type,
            steps: template(recovery_type),
            estimated_time_minutes: profile.estimated_minutes,
            risk_level: profile.risk_level,
            prerequisites: profile.prerequisites.iter().map(|s| s.to_string()).collect(),
            rollback_plan: profile.rollback_plan.iter().map(|s| s.to_string()).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&RecoveryStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Mutable lookup of a step by id.
    pub fn step_mut(&mut self, id: &str) -> Option<&mut RecoveryStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

/// Plan id of the form `plan_<yyyyMMddTHHmmssfff>`.
pub fn plan_id(now: DateTime<Utc>) -> String {
    format!("plan_{}", now.format("%Y%m%dT%H%M%S%3f"))
}

/// Static estimates and guidance for a recovery type.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryProfile {
    pub estimated_minutes: u32,
    pub risk_level: RiskLevel,
    pub prerequisites: &'static [&'static str],
    pub rollback_plan: &'static [&'static str],
}

/// Estimates and guidance for a recovery type.
pub fn profile(recovery_type: RecoveryType) -> RecoveryProfile {
    match recovery_type {
        RecoveryType::Disaster => RecoveryProfile {
            estimated_minutes: 120,
            risk_level: RiskLevel::High,
            prerequisites: &[
                "A completed full backup exists",
                "Application writes are stopped",
                "Backup storage has room for a pre-recovery backup",
            ],
            rollback_plan: &[
                "Restore the pre-recovery backup",
                "Verify store integrity",
                "Resume application writes",
            ],
        },
        RecoveryType::Corruption => RecoveryProfile {
            estimated_minutes: 60,
            risk_level: RiskLevel::Medium,
            prerequisites: &[
                "A completed full backup taken before the corruption exists",
                "Affected tables are not being written",
            ],
            rollback_plan: &[
                "Restore the affected tables from the pre-recovery backup",
                "Verify store integrity",
            ],
        },
        RecoveryType::PointInTime => RecoveryProfile {
            estimated_minutes: 90,
            risk_level: RiskLevel::High,
            prerequisites: &[
                "A completed full backup taken before the target time exists",
                "Application writes are stopped",
            ],
            rollback_plan: &[
                "Restore the pre-recovery backup",
                "Verify store integrity",
                "Resume application writes",
            ],
        },
        RecoveryType::Migration => RecoveryProfile {
            estimated_minutes: 30,
            risk_level: RiskLevel::Medium,
            prerequisites: &[
                "Migration files pass integrity verification",
                "No other migration run is in progress",
            ],
            rollback_plan: &[
                "Roll back the migrations applied by this plan",
                "Restore the pre-migration backup if a rollback script is missing",
            ],
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn step(
    id: &str,
    step_type: StepType,
    description: &str,
    parameters: Value,
    dependencies: &[&str],
    timeout_seconds: u64,
    retry_attempts: u32,
    critical: bool,
) -> RecoveryStep {
    RecoveryStep {
        id: id.to_string(),
        name: id.replace('_', " "),
        step_type,
        description: description.to_string(),
        parameters: match parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        timeout_seconds,
        retry_attempts,
        critical,
    }
}

fn pre_backup(id: &str, dependencies: &[&str]) -> RecoveryStep {
    step(
        id,
        StepType::Backup,
        "Take a full backup of the current state",
        json!({ "backup_type": "full", "description": id.replace('_', "-") }),
        dependencies,
        1800,
        2,
        true,
    )
}

fn verify_integrity(dependencies: &[&str]) -> RecoveryStep {
    step(
        "verify_integrity",
        StepType::Validation,
        "Run the store's integrity check",
        json!({ "check": "integrity_check" }),
        dependencies,
        600,
        1,
        true,
    )
}

fn notify(dependencies: &[&str]) -> RecoveryStep {
    step(
        "notify_operators",
        StepType::Notification,
        "Report the outcome to operators",
        json!({ "channel": "operators" }),
        dependencies,
        60,
        3,
        false,
    )
}

fn assess() -> RecoveryStep {
    step(
        "assess",
        StepType::Validation,
        "Check the store is reachable and list its tables",
        json!({ "check": "assess" }),
        &[],
        300,
        1,
        true,
    )
}

/// Steps of a recovery type, dependency-sorted.
pub fn template(recovery_type: RecoveryType) -> Vec<RecoveryStep> {
    match recovery_type {
        RecoveryType::Disaster => vec![
            assess(),
            pre_backup("pre_recovery_backup", &["assess"]),
            step(
                "restore_latest_backup",
                StepType::Restore,
                "Restore the latest completed full backup",
                json!({ "restore_type": "full" }),
                &["pre_recovery_backup"],
                3600,
                1,
                true,
            ),
            step(
                "apply_pending_migrations",
                StepType::Migration,
                "Apply migrations newer than the restored backup",
                json!({ "action": "run_pending" }),
                &["restore_latest_backup"],
                1800,
                0,
                true,
            ),
            verify_integrity(&["apply_pending_migrations"]),
            notify(&["verify_integrity"]),
        ],
        RecoveryType::Corruption => vec![
            step(
                "identify_corrupted_tables",
                StepType::Validation,
                "Scan every table and list those that cannot be read",
                json!({ "check": "identify_corrupted_tables" }),
                &[],
                900,
                1,
                true,
            ),
            pre_backup("pre_recovery_backup", &["identify_corrupted_tables"]),
            step(
                "selective_restore",
                StepType::Restore,
                "Restore the corrupted tables from the latest full backup",
                json!({ "restore_type": "selective", "tables_from": "identify_corrupted_tables" }),
                &["pre_recovery_backup"],
                3600,
                1,
                true,
            ),
            verify_integrity(&["selective_restore"]),
            notify(&["verify_integrity"]),
        ],
        RecoveryType::PointInTime => vec![
            assess(),
            pre_backup("pre_recovery_backup", &["assess"]),
            step(
                "restore_point_in_time",
                StepType::Restore,
                "Restore the latest full backup taken before the target time",
                json!({ "restore_type": "full" }),
                &["pre_recovery_backup"],
                3600,
                1,
                true,
            ),
            verify_integrity(&["restore_point_in_time"]),
            notify(&["verify_integrity"]),
        ],
        RecoveryType::Migration => vec![
            pre_backup("pre_migration_backup", &[]),
            step(
                "verify_migration_files",
                StepType::Validation,
                "Check applied migrations against their files",
                json!({ "check": "verify_migrations" }),
                &["pre_migration_backup"],
                300,
                0,
                true,
            ),
            step(
                "apply_pending_migrations",
                StepType::Migration,
                "Apply pending migrations",
                json!({ "action": "run_pending" }),
                &["verify_migration_files"],
                1800,
                0,
                true,
            ),
            verify_integrity(&["apply_pending_migrations"]),
            notify(&["verify_integrity"]),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(recovery_type: RecoveryType) -> Vec<String> {
        template(recovery_type).into_iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_templates() {
        assert_eq!(
            ids(RecoveryType::Disaster),
            vec![
                "assess",
                "pre_recovery_backup",
                "restore_latest_backup",
                "apply_pending_migrations",
                "verify_integrity",
                "notify_operators"
            ]
        );
        assert_eq!(
            ids(RecoveryType::Corruption),
            vec![
                "identify_corrupted_tables",
                "pre_recovery_backup",
                "selective_restore",
                "verify_integrity",
                "notify_operators"
            ]
        );
        assert_eq!(ids(RecoveryType::PointInTime)[2], "restore_point_in_time");
        assert_eq!(ids(RecoveryType::Migration)[0], "pre_migration_backup");
    }

    #[test]
    fn test_dependencies_point_backwards() {
        for recovery_type in RecoveryType::ALL {
            let steps = template(recovery_type);
            for (i, step) in steps.iter().enumerate() {
                for dep in &step.dependencies {
                    assert!(
                        steps[..i].iter().any(|s| &s.id == dep),
                        "{} depends on later step {}",
                        step.id,
                        dep
                    );
                }
            }
        }
    }

    #[test]
    fn test_plan_from_template() {
        let now = Utc::now();
        let plan = RecoveryPlan::from_template("outage", "region down", RecoveryType::Disaster, now);
        assert!(plan.id.starts_with("plan_"));
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.estimated_time_minutes, 120);
        assert!(!plan.rollback_plan.is_empty());
        assert!(!plan.step("notify_operators").unwrap().critical);
        assert_eq!(plan.step("assess").unwrap().param_str("check"), Some("assess"));
    }

    #[test]
    fn test_placeholder_parameters_decode_as_empty() {
        let plan = RecoveryPlan::from_template("p", "", RecoveryType::Migration, Utc::now());
        let mut value = serde_json::to_value(&plan).unwrap();
        value["steps"][0]["parameters"] = json!("[object Object]");
        value["steps"][1]["parameters"] = json!("");
        value["steps"][2]["parameters"] = Value::Null;
        value["steps"][3]["parameters"] = json!("{\"check\":\"integrity_check\"}");

        let decoded: RecoveryPlan = serde_json::from_value(value).unwrap();
        assert!(decoded.steps[0].parameters.is_empty());
        assert!(decoded.steps[1].parameters.is_empty());
        assert!(decoded.steps[2].parameters.is_empty());
        assert_eq!(decoded.steps[3].param_str("check"), Some("integrity_check"));
    }

    #[test]
    fn test_non_object_parameters_are_rejected() {
        let plan = RecoveryPlan::from_template("p", "", RecoveryType::Migration, Utc::now());
        let mut value = serde_json::to_value(&plan).unwrap();
        value["steps"][0]["parameters"] = json!([1, 2]);
        assert!(serde_json::from_value::<RecoveryPlan>(value).is_err());
    }
}
