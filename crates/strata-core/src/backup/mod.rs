//! Backups of the target store.
//!
//! A backup is a JSON Lines dump artifact (optionally gzip-compressed) plus a
//! `<id>.meta.json` sidecar, both stored in the backups directory. See
//! [`artifact`] for the dump layout.

pub mod artifact;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod restore;

pub use artifact::{DumpLine, ARTIFACT_FORMAT_VERSION};
pub use error::BackupError;
pub use manager::{BackupManager, SAFETY_BACKUP_DESCRIPTION};
pub use metadata::{BackupFilter, BackupMetadata, BackupStatus, BackupType, TableSummary};
pub use restore::{RestoreReport, RestoreRequest, RestoreType};
