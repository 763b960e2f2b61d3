//! Output formatting for command results.

use clap::ValueEnum;
use comfy_table::Table;
use serde::Serialize;
use strata_core::backup::BackupMetadata;
use strata_core::migration::{IntegrityIssue, MigrationRecord, MigrationStatusReport};
use strata_core::recovery::{PlanExecutionReport, RecoveryPlan};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    Table,
    /// Pretty-printed JSON
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Render a value as pretty JSON.
pub fn json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

pub fn status_table(report: &MigrationStatusReport) -> String {
    let mut out = format!(
        "Current version: {}\n",
        report.current_version.as_deref().unwrap_or("(none)")
    );

    let mut table = Table::new();
    table.set_header(vec!["Version", "State"]);
    for version in &report.applied {
        table.add_row(vec![version.as_str(), "applied"]);
    }
    for version in &report.pending {
        table.add_row(vec![version.as_str(), "pending"]);
    }
    for version in &report.rolled_back {
        table.add_row(vec![version.as_str(), "rolled back"]);
    }
    for version in &report.failed {
        table.add_row(vec![version.as_str(), "failed"]);
    }
    out.push_str(&table.to_string());

    for malformed in &report.malformed {
        out.push_str(&format!("\nmalformed: {} ({})", malformed.file, malformed.reason));
    }
    out
}

pub fn history_table(records: &[MigrationRecord]) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Version", "Executed at", "ms", "Result"]);
    for record in records {
        let result = if record.success {
            "ok".to_string()
        } else {
            record.error_message.clone().unwrap_or_else(|| "failed".to_string())
        };
        table.add_row(vec![
            record.version.clone(),
            record.executed_at.to_rfc3339(),
            record.execution_time_ms.to_string(),
            result,
        ]);
    }
    table.to_string()
}

pub fn issues_text(issues: &[IntegrityIssue]) -> String {
    if issues.is_empty() {
        return "All applied migrations match their files".to_string();
    }
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn backups_table(backups: &[BackupMetadata]) -> String {
    if backups.is_empty() {
        return "No backups".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["Id", "Type", "Status", "Started", "Rows", "Size", "Description"]);
    for backup in backups {
        table.add_row(vec![
            backup.id.clone(),
            backup.backup_type.to_string(),
            backup.status.to_string(),
            backup.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            backup.total_rows().to_string(),
            backup.compressed_size.unwrap_or(backup.uncompressed_size).to_string(),
            backup.description.clone().unwrap_or_default(),
        ]);
    }
    table.to_string()
}

pub fn plans_table(plans: &[RecoveryPlan]) -> String {
    if plans.is_empty() {
        return "No recovery plans".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["Id", "Name", "Type", "Risk", "Est. minutes", "Steps"]);
    for plan in plans {
        table.add_row(vec![
            plan.id.clone(),
            plan.name.clone(),
            plan.recovery_type.to_string(),
            format!("{:?}", plan.risk_level).to_lowercase(),
            plan.estimated_time_minutes.to_string(),
            plan.steps.len().to_string(),
        ]);
    }
    table.to_string()
}

pub fn plan_detail(plan: &RecoveryPlan) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Step", "Type", "Critical", "Retries", "Timeout s"]);
    for step in &plan.steps {
        table.add_row(vec![
            step.id.clone(),
            format!("{:?}", step.step_type).to_lowercase(),
            step.critical.to_string(),
            step.retry_attempts.to_string(),
            step.timeout_seconds.to_string(),
        ]);
    }
    format!("Plan {} ({})\n{}", plan.id, plan.recovery_type, table)
}

pub fn execution_table(report: &PlanExecutionReport) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Step", "Status", "Attempts", "Error"]);
    for step in &report.steps {
        table.add_row(vec![
            step.step_id.clone(),
            step.status.to_string(),
            step.attempts.to_string(),
            step.error.clone().unwrap_or_default(),
        ]);
    }
    format!("Plan {}: {}\n{}", report.plan_id, report.status, table)
}
