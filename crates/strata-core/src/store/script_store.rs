//! Durable storage for migration scripts and backup artifacts.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::compression::{self, ArtifactWriter};
use crate::config::EngineConfig;
use crate::error::Error;

/// Extension of migration script files.
pub const MIGRATION_EXTENSION: &str = "sql";

/// Reads and writes migration scripts and backup artifacts on local disk.
///
/// Artifact writes go to a temporary sibling file that is renamed into place
/// only once it is complete, so readers never observe a partial artifact.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    migrations_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl ScriptStore {
    /// Create a store over the given directories.
    pub fn new(migrations_dir: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Create a store using the configured directories.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.migrations_dir(), config.backups_dir())
    }

    /// Create both directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.migrations_dir)?;
        fs::create_dir_all(&self.artifacts_dir)?;
        Ok(())
    }

    /// Directory holding migration scripts.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Directory holding artifacts.
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// List migration file identifiers, ascending by embedded version.
    ///
    /// A missing directory is treated as empty.
    pub fn list_migration_files(&self) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(&self.migrations_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if Path::new(&name)
                .extension()
                .is_some_and(|ext| ext == MIGRATION_EXTENSION)
            {
                files.push(name);
            }
        }

        files.sort_by(|a, b| version_token(a).cmp(version_token(b)).then_with(|| a.cmp(b)));
        Ok(files)
    }

    /// Read a migration file.
    pub fn read_migration_file(&self, id: &str) -> Result<String, Error> {
        let path = self.migrations_dir.join(id);
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("migration file {}", id)),
            _ => Error::Io(e),
        })
    }

    /// Write a new migration file. Refuses to overwrite an existing one.
    pub fn write_migration_file(&self, id: &str, content: &str) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.migrations_dir)?;
        let path = self.migrations_dir.join(id);
        if path.exists() {
            return Err(Error::InvalidData(format!(
                "migration file {} already exists",
                id
            )));
        }
        write_atomic(&path, false, |w| {
            w.write_all(content.as_bytes())?;
            Ok(())
        })?;
        Ok(path)
    }

    /// Full path of an artifact.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.artifacts_dir.join(name)
    }

    /// Whether an artifact exists.
    pub fn artifact_exists(&self, name: &str) -> bool {
        self.artifact_path(name).is_file()
    }

    /// Stream an artifact to disk.
    ///
    /// `write` receives the uncompressed stream; when `compressed` is set the
    /// bytes are gzip-compressed transparently. Returns the closure's result
    /// and the on-disk size of the finished artifact.
    pub fn write_artifact<T, F>(&self, name: &str, compressed: bool, write: F) -> Result<(T, u64), Error>
    where
        F: FnOnce(&mut dyn Write) -> Result<T, Error>,
    {
        fs::create_dir_all(&self.artifacts_dir)?;
        let path = self.artifact_path(name);
        write_atomic(&path, compressed, write)
    }

    /// Open an artifact for reading, decompressing transparently.
    pub fn read_artifact(&self, name: &str) -> Result<Box<dyn BufRead + Send>, Error> {
        let path = self.artifact_path(name);
        compression::open_reader(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("artifact {}", name)),
            _ => Error::Io(e),
        })
    }

    /// Remove an artifact. Removing a missing artifact is not an error.
    pub fn remove_artifact(&self, name: &str) -> Result<(), Error> {
        match fs::remove_file(self.artifact_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List artifact file names with the given suffix.
    pub fn list_artifacts(&self, suffix: &str) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(&self.artifacts_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(suffix) && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Version token embedded at the start of a migration file name.
pub fn version_token(file_name: &str) -> &str {
    file_name
        .strip_suffix(MIGRATION_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .unwrap_or(file_name)
}

/// Write a file through a temporary sibling and rename it into place.
fn write_atomic<T, F>(path: &Path, compressed: bool, write: F) -> Result<(T, u64), Error>
where
    F: FnOnce(&mut dyn Write) -> Result<T, Error>,
{
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidData(format!("invalid path {}", path.display())))?
        .to_string_lossy()
        .into_owned();
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let result = (|| {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        let mut writer = ArtifactWriter::new(file, compressed);
        let value = write(&mut writer)?;
        let file: File = writer.finish()?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        fs::rename(&tmp_path, path)?;
        Ok::<_, Error>((value, size))
    })();

    match result {
        Ok((value, size)) => {
            debug!(path = %path.display(), size, compressed, "artifact written");
            Ok((value, size))
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp file");
                }
            }
            Err(e)
        }
    }
}
