//! Subcommands and their execution against an engine.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use strata_core::backup::{BackupFilter, BackupStatus, BackupType, RestoreRequest, RestoreType};
use strata_core::migration::MigrationDraft;
use strata_core::recovery::RecoveryType;
use strata_core::{Engine, EngineError, Error};

use crate::formatter::{self, OutputFormat};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show applied, pending, rolled back and failed migrations.
    Status,

    /// Show every ledger record.
    History,

    /// Apply pending migrations in version order.
    Migrate,

    /// Revert an applied migration with its down script.
    Rollback {
        version: String,
    },

    /// Apply a rolled-back migration again.
    Reapply {
        version: String,
    },

    /// Write a new migration file.
    Generate {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Version this migration depends on (repeatable).
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,
        #[arg(long)]
        up: Option<String>,
        #[arg(long)]
        down: Option<String>,
    },

    /// Compare applied migrations against their files.
    Verify,

    /// Create a backup.
    Backup {
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,
        #[arg(long)]
        description: Option<String>,
    },

    /// List backups, newest first.
    Backups {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
        #[arg(long)]
        status: Option<BackupStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Restore a backup into the target store.
    Restore {
        backup_id: String,
        #[arg(long = "type", default_value = "full")]
        restore_type: RestoreType,
        /// Table to restore with --type selective (repeatable).
        #[arg(long = "table")]
        tables: Vec<String>,
        /// Skip the checksum check before restoring.
        #[arg(long)]
        skip_validation: bool,
        /// Do not take a backup of the current state first.
        #[arg(long)]
        no_safety_backup: bool,
    },

    /// Delete completed backups past the retention period.
    Cleanup {
        /// Override the configured retention.
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Create a recovery plan.
    Plan {
        name: String,
        #[arg(long = "type")]
        recovery_type: RecoveryType,
        #[arg(long, default_value = "")]
        description: String,
        /// For point_in_time plans: restore the newest backup before this
        /// RFC 3339 instant.
        #[arg(long)]
        target_time: Option<DateTime<Utc>>,
    },

    /// List recovery plans.
    Plans,

    /// Execute a recovery plan.
    Execute {
        plan_id: String,
    },

    /// Delete a recovery plan and its last execution report.
    DeletePlan {
        plan_id: String,
    },
}

fn render<T: serde::Serialize>(
    format: OutputFormat,
    value: &T,
    table: impl FnOnce(&T) -> String,
) -> Result<String, EngineError> {
    match format {
        OutputFormat::Json => Ok(formatter::json(value).map_err(Error::from)?),
        OutputFormat::Table => Ok(table(value)),
    }
}

/// Run one command and return its rendered output.
pub fn execute(engine: &Engine, command: Command, format: OutputFormat) -> Result<String, EngineError> {
    match command {
        Command::Status => render(format, &engine.status()?, formatter::status_table),

        Command::History => render(format, &engine.history()?, |r| formatter::history_table(r)),

        Command::Migrate => render(format, &engine.migrate()?, |report| {
            if report.is_empty() {
                "No pending migrations".to_string()
            } else {
                let mut out = format!("Applied {} migration(s):", report.applied.len());
                for version in &report.applied {
                    out.push_str(&format!("\n  {}", version));
                }
                out
            }
        }),

        Command::Rollback { version } => {
            engine.rollback(&version)?;
            Ok(format!("Rolled back {}", version))
        }

        Command::Reapply { version } => {
            engine.reapply(&version)?;
            Ok(format!("Re-applied {}", version))
        }

        Command::Generate {
            name,
            description,
            dependencies,
            up,
            down,
        } => {
            let mut draft = MigrationDraft::new(name, description).with_dependencies(dependencies);
            if let Some(up) = up {
                draft = draft.with_up(up);
            }
            if let Some(down) = down {
                draft = draft.with_down(down);
            }
            let definition = engine.generate(draft)?;
            render(format, &definition, |d| format!("Created {}", d.file))
        }

        Command::Verify => render(format, &engine.verify()?, |issues| formatter::issues_text(issues)),

        Command::Backup {
            backup_type,
            description,
        } => {
            let metadata = engine.create_backup(backup_type, description.as_deref())?;
            render(format, &metadata, |m| {
                format!("Created {} backup {} ({} rows)", m.backup_type, m.id, m.total_rows())
            })
        }

        Command::Backups {
            backup_type,
            status,
            limit,
        } => {
            let mut filter = BackupFilter::all();
            if let Some(backup_type) = backup_type {
                filter = filter.with_type(backup_type);
            }
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            render(format, &engine.list_backups(&filter)?, |b| formatter::backups_table(b))
        }

        Command::Restore {
            backup_id,
            restore_type,
            tables,
            skip_validation,
            no_safety_backup,
        } => {
            let request = match restore_type {
                RestoreType::Selective => RestoreRequest::selective(backup_id, tables),
                _ => RestoreRequest::new(backup_id, restore_type),
            }
            .with_validation(!skip_validation)
            .with_safety_backup(!no_safety_backup);
            let report = engine.restore(&request)?;
            render(format, &report, |r| {
                let mut out = format!(
                    "Restored {} table(s), {} row(s) from {}",
                    r.restored_tables.len(),
                    r.rows_restored,
                    r.backup_id
                );
                if let Some(safety) = &r.safety_backup_id {
                    out.push_str(&format!("\nSafety backup: {}", safety));
                }
                out
            })
        }

        Command::Cleanup { retention_days } => {
            let removed = engine.cleanup_expired(retention_days)?;
            render(format, &removed, |ids| format!("Removed {} expired backup(s)", ids.len()))
        }

        Command::Plan {
            name,
            recovery_type,
            description,
            target_time,
        } => {
            let plan = match (recovery_type, target_time) {
                (RecoveryType::PointInTime, Some(target)) => {
                    engine.create_point_in_time_plan(&name, &description, target)?
                }
                _ => engine.create_recovery_plan(&name, &description, recovery_type)?,
            };
            render(format, &plan, formatter::plan_detail)
        }

        Command::Plans => render(format, &engine.list_recovery_plans()?, |p| formatter::plans_table(p)),

        Command::Execute { plan_id } => {
            let report = engine.execute_recovery_plan(&plan_id)?;
            render(format, &report, formatter::execution_table)
        }

        Command::DeletePlan { plan_id } => {
            engine.delete_recovery_plan(&plan_id)?;
            Ok(format!("Deleted plan {}", plan_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::EngineConfig;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_migrate_with_nothing_pending() {
        let (_dir, engine) = engine();
        let out = execute(&engine, Command::Migrate, OutputFormat::Table).unwrap();
        assert_eq!(out, "No pending migrations");
    }

    #[test]
    fn test_generate_then_status_json() {
        let (_dir, engine) = engine();
        let out = execute(
            &engine,
            Command::Generate {
                name: "create widgets".into(),
                description: String::new(),
                dependencies: vec![],
                up: Some("CREATE TABLE widgets (id INTEGER PRIMARY KEY);".into()),
                down: Some("DROP TABLE widgets;".into()),
            },
            OutputFormat::Table,
        )
        .unwrap();
        assert!(out.starts_with("Created "));

        let status = execute(&engine, Command::Status, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(value["pending"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_plan() {
        let (_dir, engine) = engine();
        let plan = engine
            .create_recovery_plan("outage", "", RecoveryType::Disaster)
            .unwrap();
        let out = execute(
            &engine,
            Command::DeletePlan {
                plan_id: plan.id.clone(),
            },
            OutputFormat::Table,
        )
        .unwrap();
        assert_eq!(out, format!("Deleted plan {}", plan.id));
        assert!(engine.list_recovery_plans().unwrap().is_empty());

        let err = execute(&engine, Command::DeletePlan { plan_id: plan.id }, OutputFormat::Table).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_rollback_of_unknown_version_is_precondition() {
        let (_dir, engine) = engine();
        let err = execute(
            &engine,
            Command::Rollback {
                version: "20240101T000000_nope".into(),
            },
            OutputFormat::Table,
        )
        .unwrap_err();
        assert!(err.is_precondition());
    }
}
