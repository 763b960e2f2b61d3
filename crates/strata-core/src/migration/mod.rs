//! Versioned schema migrations.
//!
//! Migrations are SQL files in the script store, applied in version order by
//! [`MigrationRunner`] and recorded in a ledger table inside the target store:
//!
//! - [`MigrationCatalog`] discovers and parses the files
//! - [`MigrationHistory`] reads and writes the ledger
//! - [`MigrationRunner`] applies, rolls back and verifies
//!
//! # Example
//!
//! ```ignore
//! use strata_core::migration::{MigrationHistory, MigrationRunner};
//!
//! let runner = MigrationRunner::new(target, scripts, MigrationHistory::new("schema_migrations"))?;
//! let report = runner.run_pending()?;
//! for issue in runner.verify_integrity()? {
//!     eprintln!("{issue}");
//! }
//! ```

pub mod catalog;
pub mod definition;
pub mod error;
pub mod history;
pub mod runner;

pub use catalog::{MalformedFile, MigrationCatalog};
pub use definition::{MigrationDefinition, MigrationDraft};
pub use error::MigrationError;
pub use history::{MigrationHistory, MigrationRecord};
pub use runner::{IntegrityIssue, MigrationRunner, MigrationStatusReport, RunReport};
