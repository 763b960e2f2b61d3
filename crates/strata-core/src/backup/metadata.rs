//! Backup metadata structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix of the JSON sidecar stored next to each artifact.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Extension of dump artifacts before compression.
pub const ARTIFACT_EXTENSION: &str = "jsonl";

/// Type of backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Structure and data of every table
    Full,
    /// Rows changed since the last completed backup of any type
    Incremental,
    /// Rows changed since the last full backup
    Differential,
    /// Structure only
    SchemaOnly,
    /// Data only
    DataOnly,
    /// Operator-requested full backup
    Manual,
}

impl BackupType {
    /// Every backup type.
    pub const ALL: [BackupType; 6] = [
        BackupType::Full,
        BackupType::Incremental,
        BackupType::Differential,
        BackupType::SchemaOnly,
        BackupType::DataOnly,
        BackupType::Manual,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
            BackupType::SchemaOnly => "schema_only",
            BackupType::DataOnly => "data_only",
            BackupType::Manual => "manual",
        }
    }

    /// Whether the artifact carries table structure.
    pub fn includes_structure(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Manual | BackupType::SchemaOnly)
    }

    /// Whether the artifact carries rows.
    pub fn includes_data(&self) -> bool {
        !matches!(self, BackupType::SchemaOnly)
    }

    /// Whether only changed rows are captured.
    pub fn is_change_based(&self) -> bool {
        matches!(self, BackupType::Incremental | BackupType::Differential)
    }

    /// Whether the backup is a complete copy usable as a differential base.
    pub fn is_full(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Manual)
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown backup type: {}", s))
    }
}

/// Lifecycle status of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BackupStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
            BackupStatus::Expired => "expired",
        }
    }

    /// Whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::Pending | BackupStatus::Running)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            BackupStatus::Pending,
            BackupStatus::Running,
            BackupStatus::Completed,
            BackupStatus::Failed,
            BackupStatus::Cancelled,
            BackupStatus::Expired,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown backup status: {}", s))
    }
}

/// Per-table contents of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    /// Table name
    pub name: String,
    /// Rows written for this table
    pub row_count: u64,
}

/// Backup metadata, persisted as a JSON sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Unique backup identifier
    pub id: String,
    /// Type of backup
    pub backup_type: BackupType,
    /// Lifecycle status
    pub status: BackupStatus,
    /// Operator-supplied description
    pub description: Option<String>,
    /// When the backup started
    pub start_time: DateTime<Utc>,
    /// When the backup reached a terminal status
    pub end_time: Option<DateTime<Utc>>,
    /// Time taken
    pub duration_ms: Option<u64>,
    /// Size of the logical dump in bytes
    pub uncompressed_size: u64,
    /// On-disk size when compressed
    pub compressed_size: Option<u64>,
    /// Whether the artifact is gzip-compressed
    pub compressed: bool,
    /// Artifact file name, relative to the backups directory
    pub location: String,
    /// Digest of the uncompressed dump
    pub checksum: String,
    /// Algorithm that produced `checksum`
    pub checksum_algorithm: String,
    /// Greatest applied migration version at backup time
    pub store_version: Option<String>,
    /// Change cut-off of incremental and differential backups
    pub since: Option<DateTime<Utc>>,
    /// Tables captured
    #[serde(default)]
    pub tables: Vec<TableSummary>,
    /// Failure reason
    pub error_message: Option<String>,
}

impl BackupMetadata {
    /// Metadata for a backup that is starting now.
    pub fn start(
        id: String,
        backup_type: BackupType,
        description: Option<String>,
        compressed: bool,
        start_time: DateTime<Utc>,
        checksum_algorithm: &str,
    ) -> Self {
        let location = artifact_name(&id, compressed);
        Self {
            id,
            backup_type,
            status: BackupStatus::Running,
            description,
            start_time,
            end_time: None,
            duration_ms: None,
            uncompressed_size: 0,
            compressed_size: None,
            compressed,
            location,
            checksum: String::new(),
            checksum_algorithm: checksum_algorithm.to_string(),
            store_version: None,
            since: None,
            tables: Vec::new(),
            error_message: None,
        }
    }

    /// Mark the backup completed.
    pub fn complete(&mut self, end_time: DateTime<Utc>, checksum: String, uncompressed_size: u64, disk_size: u64) {
        self.status = BackupStatus::Completed;
        self.checksum = checksum;
        self.uncompressed_size = uncompressed_size;
        self.compressed_size = self.compressed.then_some(disk_size);
        self.finish(end_time);
    }

    /// Mark the backup failed.
    pub fn fail(&mut self, end_time: DateTime<Utc>, error: impl Into<String>) {
        self.status = BackupStatus::Failed;
        self.error_message = Some(error.into());
        self.finish(end_time);
    }

    fn finish(&mut self, end_time: DateTime<Utc>) {
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0) as u64);
        self.end_time = Some(end_time);
    }

    /// File name of this backup's sidecar.
    pub fn sidecar_name(&self) -> String {
        sidecar_name(&self.id)
    }

    /// Total rows captured.
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.row_count).sum()
    }
}

/// Sidecar file name for a backup id.
pub fn sidecar_name(id: &str) -> String {
    format!("{}{}", id, SIDECAR_SUFFIX)
}

/// Artifact file name for a backup id.
pub fn artifact_name(id: &str, compressed: bool) -> String {
    if compressed {
        format!("{}.{}.{}", id, ARTIFACT_EXTENSION, crate::store::GZIP_EXTENSION)
    } else {
        format!("{}.{}", id, ARTIFACT_EXTENSION)
    }
}

/// Backup id of the form `backup_<yyyyMMddTHHmmssfff>_<type>`.
pub fn backup_id(now: DateTime<Utc>, backup_type: BackupType) -> String {
    format!("backup_{}_{}", now.format("%Y%m%dT%H%M%S%3f"), backup_type)
}

/// Criteria for listing backups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFilter {
    /// Only this type
    pub backup_type: Option<BackupType>,
    /// Only this status
    pub status: Option<BackupStatus>,
    /// At most this many, newest first
    pub limit: Option<usize>,
}

impl BackupFilter {
    /// Match every backup.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a type.
    pub fn with_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = Some(backup_type);
        self
    }

    /// Restrict to a status.
    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Limit the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a backup passes the type and status criteria.
    pub fn matches(&self, metadata: &BackupMetadata) -> bool {
        self.backup_type.map_or(true, |t| t == metadata.backup_type)
            && self.status.map_or(true, |s| s == metadata.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> BackupMetadata {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        BackupMetadata::start(
            backup_id(start, BackupType::Full),
            BackupType::Full,
            Some("nightly".into()),
            true,
            start,
            "sha256",
        )
    }

    #[test]
    fn test_ids_and_names() {
        let meta = started();
        assert_eq!(meta.id, "backup_20240501T030000000_full");
        assert_eq!(meta.location, "backup_20240501T030000000_full.jsonl.gz");
        assert_eq!(meta.sidecar_name(), "backup_20240501T030000000_full.meta.json");
        assert_eq!(artifact_name("b", false), "b.jsonl");
    }

    #[test]
    fn test_lifecycle() {
        let mut meta = started();
        assert_eq!(meta.status, BackupStatus::Running);
        assert!(!meta.status.is_terminal());

        let end = meta.start_time + chrono::Duration::milliseconds(1500);
        meta.complete(end, "abc".into(), 4096, 512);
        assert_eq!(meta.status, BackupStatus::Completed);
        assert_eq!(meta.duration_ms, Some(1500));
        assert_eq!(meta.compressed_size, Some(512));
        assert_eq!(meta.uncompressed_size, 4096);

        let mut failed = started();
        failed.fail(end, "disk full");
        assert_eq!(failed.status, BackupStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_sidecar_json_shape() {
        let meta = started();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["backup_type"], "full");
        assert_eq!(json["status"], "running");

        let back: BackupMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_type_properties() {
        assert!(BackupType::Manual.includes_structure());
        assert!(!BackupType::DataOnly.includes_structure());
        assert!(!BackupType::SchemaOnly.includes_data());
        assert!(BackupType::Differential.is_change_based());
        assert_eq!("schema_only".parse::<BackupType>(), Ok(BackupType::SchemaOnly));
        assert!("weekly".parse::<BackupType>().is_err());
        assert_eq!("expired".parse::<BackupStatus>(), Ok(BackupStatus::Expired));
    }

    #[test]
    fn test_filter() {
        let meta = started();
        assert!(BackupFilter::all().matches(&meta));
        assert!(BackupFilter::all().with_type(BackupType::Full).matches(&meta));
        assert!(!BackupFilter::all()
            .with_status(BackupStatus::Completed)
            .matches(&meta));
    }
}
