//! Backup manager implementation

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument, warn};

use super::artifact::{checksum_stream, dump_tables, DumpLine, DumpScope, DumpWriter, ARTIFACT_FORMAT_VERSION};
use super::error::BackupError;
use super::metadata::{
    backup_id, sidecar_name, BackupFilter, BackupMetadata, BackupStatus, BackupType, TableSummary,
    SIDECAR_SUFFIX,
};
use super::restore::{apply_artifact, RestorePlan, RestoreReport, RestoreRequest};
use crate::checksum::{provider_for, ChecksumProvider, Sha256Checksum};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::migration::MigrationHistory;
use crate::store::ScriptStore;
use crate::target::{list_tables, table_exists, TargetStore};

/// Description given to the backup taken before a restore.
pub const SAFETY_BACKUP_DESCRIPTION: &str = "pre-restore backup";

struct DumpSummary {
    checksum: String,
    bytes: u64,
    tables: Vec<TableSummary>,
    store_version: Option<String>,
}

/// Creates, lists, restores and expires backups of the target store.
pub struct BackupManager {
    target: Arc<TargetStore>,
    scripts: ScriptStore,
    config: Arc<EngineConfig>,
    history: MigrationHistory,
    checksum: Arc<dyn ChecksumProvider>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(target: Arc<TargetStore>, scripts: ScriptStore, config: Arc<EngineConfig>) -> Self {
        let history = MigrationHistory::new(config.history_table.clone());
        Self {
            target,
            scripts,
            config,
            history,
            checksum: Arc::new(Sha256Checksum),
        }
    }

    /// Use a different checksum provider for new backups.
    pub fn with_checksum(mut self, checksum: Arc<dyn ChecksumProvider>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Back up structure and data of every table.
    pub fn create_full_backup(&self, description: Option<&str>, compress: bool) -> Result<BackupMetadata, BackupError> {
        self.run(BackupType::Full, description, compress, None, true)
    }

    /// Back up rows changed at or after `since`.
    pub fn create_incremental_backup(
        &self,
        since: DateTime<Utc>,
        description: Option<&str>,
    ) -> Result<BackupMetadata, BackupError> {
        self.run(
            BackupType::Incremental,
            description,
            self.config.compress_backups,
            Some(since),
            true,
        )
    }

    /// Create a backup of any type with the configured compression.
    ///
    /// Incremental backups capture changes since the start of the last
    /// completed backup; differential backups since the last full one. With
    /// no such base, every row carrying the last-modified column is captured.
    pub fn create_backup(&self, backup_type: BackupType, description: Option<&str>) -> Result<BackupMetadata, BackupError> {
        let since = match backup_type {
            BackupType::Incremental => Some(self.change_base(|_| true)?),
            BackupType::Differential => Some(self.change_base(BackupType::is_full)?),
            _ => None,
        };
        self.run(backup_type, description, self.config.compress_backups, since, true)
    }

    fn change_base(&self, accept: impl Fn(&BackupType) -> bool) -> Result<DateTime<Utc>, BackupError> {
        let base = self
            .load_all()?
            .into_iter()
            .filter(|m| m.status == BackupStatus::Completed && accept(&m.backup_type))
            .map(|m| m.start_time)
            .max();
        Ok(base.unwrap_or_default())
    }

    #[instrument(skip(self, description), fields(backup_type = %backup_type))]
    fn run(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
        compress: bool,
        since: Option<DateTime<Utc>>,
        apply_retention: bool,
    ) -> Result<BackupMetadata, BackupError> {
        let started = Utc::now();
        let id = self.unique_id(started, backup_type);
        let mut metadata = BackupMetadata::start(
            id,
            backup_type,
            description.map(str::to_string),
            compress,
            started,
            self.checksum.algorithm(),
        );
        metadata.since = since.filter(|_| backup_type.is_change_based());
        self.write_metadata(&metadata)?;
        info!(backup_id = %metadata.id, "backup started");

        let timer = Instant::now();
        match self.write_dump(&metadata) {
            Ok((summary, disk_size)) => {
                metadata.tables = summary.tables;
                metadata.store_version = summary.store_version;
                metadata.complete(Utc::now(), summary.checksum, summary.bytes, disk_size);
                self.write_metadata(&metadata)?;
                info!(
                    backup_id = %metadata.id,
                    tables = metadata.tables.len(),
                    rows = metadata.total_rows(),
                    bytes = metadata.uncompressed_size,
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    "backup completed"
                );

                if apply_retention {
                    if let Err(e) = self.cleanup_expired(self.config.retention_days) {
                        warn!(error = %e, "retention cleanup after backup failed");
                    }
                }
                Ok(metadata)
            }
            Err(e) => {
                error!(backup_id = %metadata.id, error = %e, "backup failed");
                metadata.fail(Utc::now(), e.to_string());
                if let Err(write_err) = self.write_metadata(&metadata) {
                    error!(backup_id = %metadata.id, error = %write_err, "failed to record backup failure");
                }
                Err(e.into())
            }
        }
    }

    fn unique_id(&self, now: DateTime<Utc>, backup_type: BackupType) -> String {
        let base = backup_id(now, backup_type);
        let mut id = base.clone();
        let mut n = 1;
        while self.scripts.artifact_exists(&sidecar_name(&id)) {
            n += 1;
            id = format!("{}_{}", base, n);
        }
        id
    }

    fn write_dump(&self, metadata: &BackupMetadata) -> Result<(DumpSummary, u64), Error> {
        let scope = DumpScope::for_type(metadata.backup_type, metadata.since, &self.config.modified_column);

        self.scripts
            .write_artifact(&metadata.location, metadata.compressed, |out| {
                self.target.snapshot(|tx| {
                    let store_version = if table_exists(tx, self.history.table())? {
                        self.history
                            .current_version(tx)
                            .map_err(|e| Error::InvalidData(e.to_string()))?
                    } else {
                        None
                    };
                    // The ledger is recorded as `store_version`, not as rows.
                    let tables: Vec<String> = list_tables(tx)?
                        .into_iter()
                        .filter(|t| t != self.history.table() && !self.config.is_excluded(t))
                        .collect();

                    let mut writer = DumpWriter::new(out, self.checksum.as_ref());
                    writer.write_line(&DumpLine::Header {
                        format_version: ARTIFACT_FORMAT_VERSION,
                        backup_id: metadata.id.clone(),
                        backup_type: metadata.backup_type,
                        store_version: store_version.clone(),
                        created_at: metadata.start_time,
                        since: metadata.since,
                    })?;
                    let tables = dump_tables(tx, &tables, &scope, &mut writer)?;
                    let (checksum, bytes) = writer.finish();
                    Ok(DumpSummary {
                        checksum,
                        bytes,
                        tables,
                        store_version,
                    })
                })
            })
    }

    /// Restore a backup.
    ///
    /// Preconditions (backup exists, completed, intact) are checked before
    /// anything is written. The safety backup, if requested, is taken next;
    /// tables are then restored one transaction at a time. The migration
    /// ledger is left as it is, so migrations applied after the backup stay
    /// recorded along with the tables they created.
    #[instrument(skip(self, request), fields(backup_id = %request.backup_id, restore_type = %request.restore_type))]
    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport, BackupError> {
        let timer = Instant::now();
        let metadata = self.get_backup(&request.backup_id)?;
        if metadata.status != BackupStatus::Completed {
            return Err(BackupError::NotCompleted {
                id: metadata.id,
                status: metadata.status.to_string(),
            });
        }
        if !self.scripts.artifact_exists(&metadata.location) {
            return Err(BackupError::ArtifactNotFound { id: metadata.id });
        }
        let plan = RestorePlan::new(request, &metadata, self.history.table())?;

        if request.validate_before_restore {
            self.validate(&metadata)?;
        }

        let safety_backup_id = if request.create_safety_backup {
            let safety = self
                .run(
                    BackupType::Full,
                    Some(SAFETY_BACKUP_DESCRIPTION),
                    self.config.compress_backups,
                    None,
                    false,
                )
                .map_err(|e| BackupError::SafetyBackupFailed(e.to_string()))?;
            info!(safety_backup_id = %safety.id, "safety backup taken");
            Some(safety.id)
        } else {
            None
        };

        let reader = self.scripts.read_artifact(&metadata.location)?;
        let (restored_tables, rows_restored) = apply_artifact(&self.target, reader, &plan, &metadata.id)?;

        let report = RestoreReport {
            backup_id: metadata.id,
            restore_type: request.restore_type,
            restored_tables,
            rows_restored,
            safety_backup_id,
            duration_ms: timer.elapsed().as_millis() as u64,
        };
        info!(
            tables = report.restored_tables.len(),
            rows = report.rows_restored,
            "restore completed"
        );
        Ok(report)
    }

    /// Recompute an artifact's checksum and compare it to the recorded one.
    pub fn validate(&self, metadata: &BackupMetadata) -> Result<(), BackupError> {
        let violation = |reason: String| BackupError::IntegrityViolation {
            id: metadata.id.clone(),
            reason,
        };

        let provider = provider_for(&metadata.checksum_algorithm)
            .ok_or_else(|| violation(format!("unknown checksum algorithm {}", metadata.checksum_algorithm)))?;
        let reader = self.scripts.read_artifact(&metadata.location).map_err(|e| {
            if e.is_not_found() {
                BackupError::ArtifactNotFound {
                    id: metadata.id.clone(),
                }
            } else {
                violation(e.to_string())
            }
        })?;
        let (checksum, _) = checksum_stream(reader, provider.as_ref())
            .map_err(|e| violation(format!("artifact cannot be read: {}", e)))?;

        if checksum != metadata.checksum {
            warn!(backup_id = %metadata.id, "backup checksum mismatch");
            return Err(violation(format!(
                "checksum mismatch: recorded {}, computed {}",
                metadata.checksum, checksum
            )));
        }
        Ok(())
    }

    /// Metadata of one backup.
    pub fn get_backup(&self, id: &str) -> Result<BackupMetadata, BackupError> {
        match self.read_metadata(&sidecar_name(id)) {
            Ok(metadata) => Ok(metadata),
            Err(BackupError::Storage(e)) if e.is_not_found() => {
                Err(BackupError::ArtifactNotFound { id: id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    /// Backups matching `filter`, newest first.
    pub fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut backups: Vec<_> = self
            .load_all()?
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            backups.truncate(limit);
        }
        Ok(backups)
    }

    /// Newest completed backup of one of `types` (any type if empty) that
    /// started before `before`.
    pub fn latest_completed(
        &self,
        types: &[BackupType],
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<BackupMetadata>, BackupError> {
        let filter = BackupFilter::all().with_status(BackupStatus::Completed);
        Ok(self.list_backups(&filter)?.into_iter().find(|m| {
            (types.is_empty() || types.contains(&m.backup_type))
                && before.map_or(true, |b| m.start_time < b)
        }))
    }

    /// Delete completed backups that started more than `retention_days` ago.
    ///
    /// The artifact is removed before the sidecar; if the artifact cannot be
    /// removed the sidecar is kept so the backup stays visible. Returns the
    /// ids removed.
    #[instrument(skip(self))]
    pub fn cleanup_expired(&self, retention_days: u32) -> Result<Vec<String>, BackupError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut removed = Vec::new();

        for metadata in self.load_all()? {
            if metadata.status != BackupStatus::Completed || metadata.start_time >= cutoff {
                continue;
            }
            if let Err(e) = self.scripts.remove_artifact(&metadata.location) {
                warn!(backup_id = %metadata.id, error = %e, "failed to remove expired artifact");
                continue;
            }
            if let Err(e) = self.scripts.remove_artifact(&metadata.sidecar_name()) {
                warn!(backup_id = %metadata.id, error = %e, "failed to remove expired metadata");
                continue;
            }
            info!(backup_id = %metadata.id, started = %metadata.start_time, "expired backup removed");
            removed.push(metadata.id);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "retention cleanup complete");
        }
        Ok(removed)
    }

    fn load_all(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut all = Vec::new();
        for name in self.scripts.list_artifacts(SIDECAR_SUFFIX)? {
            match self.read_metadata(&name) {
                Ok(metadata) => all.push(metadata),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable backup metadata"),
            }
        }
        Ok(all)
    }

    fn read_metadata(&self, name: &str) -> Result<BackupMetadata, BackupError> {
        let reader = self.scripts.read_artifact(name)?;
        Ok(serde_json::from_reader(reader)?)
    }

    fn write_metadata(&self, metadata: &BackupMetadata) -> Result<(), BackupError> {
        self.scripts
            .write_artifact(&metadata.sidecar_name(), false, |w| {
                serde_json::to_writer_pretty(&mut *w, metadata)?;
                w.write_all(b"\n")?;
                Ok(())
            })?;
        Ok(())
    }
}
