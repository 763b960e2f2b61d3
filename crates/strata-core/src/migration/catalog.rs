//! Discovery of migration definitions from the script store.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use super::definition::{parse_version, MigrationDefinition};
use super::error::MigrationError;
use crate::checksum::ChecksumProvider;
use crate::error::Error;
use crate::store::ScriptStore;

/// A migration file that could not be catalogued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedFile {
    /// File name.
    pub file: String,
    /// Version extracted from the file name, if any.
    pub version: Option<String>,
    /// Why the file was rejected.
    pub reason: String,
}

/// The set of migration definitions found in storage.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    definitions: BTreeMap<String, MigrationDefinition>,
    malformed: Vec<MalformedFile>,
}

impl MigrationCatalog {
    /// Load every migration file, skipping and recording malformed ones.
    pub fn load(store: &ScriptStore, checksum: &dyn ChecksumProvider) -> Result<Self, Error> {
        let mut catalog = Self::default();

        for file in store.list_migration_files()? {
            let content = store.read_migration_file(&file)?;
            match MigrationDefinition::parse(&file, &content, checksum) {
                Ok(definition) => {
                    catalog
                        .definitions
                        .insert(definition.version.clone(), definition);
                }
                Err(MigrationError::Malformed { reason, .. }) => {
                    let version = parse_version(&file).map(str::to_string);
                    catalog.reject(&file, version, &reason);
                }
                Err(other) => return Err(Error::InvalidData(other.to_string())),
            }
        }

        debug!(
            migrations = catalog.definitions.len(),
            malformed = catalog.malformed.len(),
            "migration catalog loaded"
        );
        Ok(catalog)
    }

    fn reject(&mut self, file: &str, version: Option<String>, reason: &str) {
        warn!(file, reason, "skipping malformed migration file");
        self.malformed.push(MalformedFile {
            file: file.to_string(),
            version,
            reason: reason.to_string(),
        });
    }

    /// All definitions, ascending by version.
    pub fn all(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.definitions.values()
    }

    /// Look up a definition by version.
    pub fn by_version(&self, version: &str) -> Option<&MigrationDefinition> {
        self.definitions.get(version)
    }

    /// Files that failed to parse.
    pub fn malformed(&self) -> &[MalformedFile] {
        &self.malformed
    }

    /// Malformed entry for a version, if its file exists but does not parse.
    pub fn malformed_version(&self, version: &str) -> Option<&MalformedFile> {
        self.malformed
            .iter()
            .find(|m| m.version.as_deref() == Some(version))
    }

    /// Definitions not in `excluded`, ascending by version.
    pub fn pending<'a>(&'a self, excluded: &BTreeSet<String>) -> Vec<&'a MigrationDefinition> {
        self.all()
            .filter(|d| !excluded.contains(&d.version))
            .collect()
    }

    /// Number of catalogued definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether no definitions were found.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
