//! Migration definitions and the on-disk migration file format.
//!
//! One file per version, named `<version>.sql` where the version has the form
//! `yyyyMMddTHHmmss_slug`. The file holds labeled sections in a fixed order:
//!
//! ```text
//! -- Migration: Create users
//! -- Version: 20240101T120000_create_users
//! -- Description: First line of the description
//! -- Description: Second line
//! -- Dependencies: 20231201T000000_base, 20231215T000000_roles
//! -- Created: 2024-01-01T12:00:00+00:00
//!
//! -- UP
//! CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
//!
//! -- DOWN
//! DROP TABLE users;
//! ```
//!
//! The `-- DOWN` section is optional. Header lines other than `Version` are
//! optional; a missing `Migration` name defaults to the version's slug.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MigrationError;
use crate::checksum::ChecksumProvider;
use crate::store::version_token;

/// Marker line opening the up section.
pub const UP_MARKER: &str = "-- UP";

/// Marker line opening the down section.
pub const DOWN_MARKER: &str = "-- DOWN";

/// An immutable migration loaded from a script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    /// Globally unique, lexicographically sortable version.
    pub version: String,
    /// Human-readable name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Statements applying the change.
    pub up_script: String,
    /// Statements reverting the change.
    pub down_script: Option<String>,
    /// Versions that must be applied first.
    pub dependencies: Vec<String>,
    /// Digest of the full file content.
    pub checksum: String,
    /// Source file name.
    pub file: String,
}

/// The authored content of a migration, before it has a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationDraft {
    pub name: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub up_script: String,
    pub down_script: Option<String>,
}

impl MigrationDraft {
    /// Create a draft with a name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: single_line(&name.into()),
            description: description.into(),
            ..Default::default()
        }
    }

    /// Set the dependencies.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the up script.
    pub fn with_up(mut self, up: impl Into<String>) -> Self {
        self.up_script = up.into();
        self
    }

    /// Set the down script.
    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down_script = Some(down.into());
        self
    }

    /// Render the file content for the given version.
    pub fn render(&self, version: &str, created_at: Option<DateTime<Utc>>) -> String {
        render_file(
            version,
            &self.name,
            &self.description,
            &self.dependencies,
            &self.up_script,
            self.down_script.as_deref(),
            created_at,
        )
    }
}

impl MigrationDefinition {
    /// Parse a migration file.
    pub fn parse(
        file: &str,
        content: &str,
        checksum: &dyn ChecksumProvider,
    ) -> Result<Self, MigrationError> {
        let malformed = |reason: &str| MigrationError::Malformed {
            file: file.to_string(),
            reason: reason.to_string(),
        };

        let version = parse_version(file)
            .ok_or_else(|| malformed("version cannot be extracted from the file name"))?
            .to_string();

        #[derive(PartialEq)]
        enum Section {
            Header,
            Up,
            Down,
        }

        let mut section = Section::Header;
        let mut name = None;
        let mut description: Vec<&str> = Vec::new();
        let mut dependencies: Vec<String> = Vec::new();
        let mut up_lines: Vec<&str> = Vec::new();
        let mut down_lines: Vec<&str> = Vec::new();
        let mut saw_up = false;

        for line in content.lines() {
            let marker = line.trim();
            if marker.eq_ignore_ascii_case(UP_MARKER) && section == Section::Header {
                section = Section::Up;
                saw_up = true;
                continue;
            }
            if marker.eq_ignore_ascii_case(DOWN_MARKER) && section == Section::Up {
                section = Section::Down;
                continue;
            }

            match section {
                Section::Header => {
                    if marker.is_empty() {
                        continue;
                    }
                    let Some(body) = marker.strip_prefix("--") else {
                        return Err(malformed("statement outside of the -- UP / -- DOWN sections"));
                    };
                    let Some((key, value)) = body.trim_start().split_once(':') else {
                        continue;
                    };
                    let raw = value.strip_prefix(' ').unwrap_or(value);
                    match key.trim().to_ascii_lowercase().as_str() {
                        "migration" | "name" => name = Some(raw.trim().to_string()),
                        "version" => {
                            if raw.trim() != version {
                                return Err(malformed("Version header does not match the file name"));
                            }
                        }
                        "description" => description.push(header_value(line)),
                        "dependencies" => {
                            for dep in raw.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                                if !dependencies.iter().any(|d| d == dep) {
                                    dependencies.push(dep.to_string());
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Section::Up => up_lines.push(line),
                Section::Down => down_lines.push(line),
            }
        }

        if !saw_up {
            return Err(malformed("missing -- UP section"));
        }
        let up_script = up_lines.join("\n").trim().to_string();
        if up_script.is_empty() {
            return Err(malformed("empty -- UP section"));
        }
        let down_script = Some(down_lines.join("\n").trim().to_string()).filter(|s| !s.is_empty());

        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| slug_of(&version).to_string());

        Ok(Self {
            version,
            name,
            description: description.join("\n"),
            up_script,
            down_script,
            dependencies,
            checksum: checksum.hash(content.as_bytes()),
            file: file.to_string(),
        })
    }

    /// Render this definition back into file content.
    pub fn render(&self) -> String {
        render_file(
            &self.version,
            &self.name,
            &self.description,
            &self.dependencies,
            &self.up_script,
            self.down_script.as_deref(),
            None,
        )
    }

    /// Whether a down script exists.
    pub fn has_rollback(&self) -> bool {
        self.down_script.is_some()
    }

    /// File name for a version.
    pub fn file_name(version: &str) -> String {
        format!("{}.{}", version, crate::store::MIGRATION_EXTENSION)
    }
}

fn render_file(
    version: &str,
    name: &str,
    description: &str,
    dependencies: &[String],
    up: &str,
    down: Option<&str>,
    created_at: Option<DateTime<Utc>>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("-- Migration: {}\n", single_line(name)));
    out.push_str(&format!("-- Version: {}\n", version));
    for line in description.split('\n') {
        out.push_str(&format!("-- Description: {}\n", line));
    }
    if !dependencies.is_empty() {
        out.push_str(&format!("-- Dependencies: {}\n", dependencies.join(", ")));
    }
    if let Some(created_at) = created_at {
        out.push_str(&format!("-- Created: {}\n", created_at.to_rfc3339()));
    }
    out.push('\n');
    out.push_str(UP_MARKER);
    out.push('\n');
    out.push_str(up.trim());
    out.push('\n');
    if let Some(down) = down.map(str::trim).filter(|d| !d.is_empty()) {
        out.push('\n');
        out.push_str(DOWN_MARKER);
        out.push('\n');
        out.push_str(down);
        out.push('\n');
    }
    out
}

/// Value of a `-- Key: value` line with exactly one separating space removed.
fn header_value(line: &str) -> &str {
    let value = line.split_once(':').map(|(_, v)| v).unwrap_or("");
    value.strip_prefix(' ').unwrap_or(value)
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the version from a migration file name.
pub fn parse_version(file: &str) -> Option<&str> {
    let token = version_token(file);
    if token.len() == file.len() || !is_valid_version(token) {
        return None;
    }
    Some(token)
}

/// Whether a string has the `yyyyMMddTHHmmss_slug` shape.
pub fn is_valid_version(version: &str) -> bool {
    let bytes = version.as_bytes();
    if bytes.len() < 17 {
        return false;
    }
    bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'T'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'_'
        && bytes[16..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

fn slug_of(version: &str) -> &str {
    version.get(16..).unwrap_or(version)
}

/// Build a version token for a new migration created at `now`.
pub fn new_version(now: DateTime<Utc>, name: &str) -> String {
    format!("{}_{}", now.format("%Y%m%dT%H%M%S"), slugify(name))
}

/// Lowercase, underscore-separated slug of a name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Sha256Checksum;
    use chrono::TimeZone;

    const FILE: &str = "20240101T120000_create_users.sql";

    fn parse(content: &str) -> Result<MigrationDefinition, MigrationError> {
        MigrationDefinition::parse(FILE, content, &Sha256Checksum)
    }

    #[test]
    fn test_parse_full_file() {
        let content = "-- Migration: Create users\n\
                       -- Version: 20240101T120000_create_users\n\
                       -- Description: Users table\n\
                       -- Dependencies: 20231201T000000_base, 20231215T000000_roles\n\
                       \n\
                       -- UP\n\
                       CREATE TABLE users (id INTEGER PRIMARY KEY);\n\
                       \n\
                       -- DOWN\n\
                       DROP TABLE users;\n";
        let def = parse(content).unwrap();
        assert_eq!(def.version, "20240101T120000_create_users");
        assert_eq!(def.name, "Create users");
        assert_eq!(def.description, "Users table");
        assert_eq!(
            def.dependencies,
            vec!["20231201T000000_base", "20231215T000000_roles"]
        );
        assert_eq!(def.up_script, "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        assert_eq!(def.down_script.as_deref(), Some("DROP TABLE users;"));
        assert_eq!(def.checksum, Sha256Checksum.hash(content.as_bytes()));
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let draft = MigrationDraft::new("Add email", "Adds email.\nBackfilled later.\n")
            .with_dependencies(vec!["20231201T000000_base".into()])
            .with_up("-- column\nALTER TABLE users ADD COLUMN email TEXT;")
            .with_down("ALTER TABLE users DROP COLUMN email;");
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let content = draft.render("20240101T120000_create_users", Some(created));

        let def = parse(&content).unwrap();
        assert_eq!(def.name, draft.name);
        assert_eq!(def.description, draft.description);
        assert_eq!(def.dependencies, draft.dependencies);
        assert_eq!(def.up_script, draft.up_script);
        assert_eq!(def.down_script, draft.down_script);

        assert_eq!(parse(&def.render()).unwrap().up_script, def.up_script);
    }

    #[test]
    fn test_empty_description_roundtrip() {
        let content = MigrationDraft::new("x", "").with_up("SELECT 1;").render(
            "20240101T120000_create_users",
            None,
        );
        assert_eq!(parse(&content).unwrap().description, "");
    }

    #[test]
    fn test_down_section_is_optional() {
        let def = parse("-- UP\nCREATE TABLE t (id INTEGER);\n").unwrap();
        assert!(def.down_script.is_none());
        assert!(!def.has_rollback());
        assert_eq!(def.name, "create_users");
    }

    #[test]
    fn test_malformed_files() {
        let bad_name = MigrationDefinition::parse("create_users.sql", "-- UP\nSELECT 1;", &Sha256Checksum);
        assert!(matches!(bad_name, Err(MigrationError::Malformed { .. })));

        assert!(matches!(
            parse("-- Migration: x\n"),
            Err(MigrationError::Malformed { .. })
        ));
        assert!(matches!(
            parse("-- UP\n\n   \n-- DOWN\nDROP TABLE t;"),
            Err(MigrationError::Malformed { .. })
        ));
        assert!(matches!(
            parse("CREATE TABLE t (id INTEGER);\n-- UP\nSELECT 1;"),
            Err(MigrationError::Malformed { .. })
        ));
        assert!(matches!(
            parse("-- Version: 20990101T000000_other\n-- UP\nSELECT 1;"),
            Err(MigrationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_duplicate_dependencies_collapse() {
        let def = parse("-- Dependencies: a, b, a,\n-- UP\nSELECT 1;").unwrap();
        assert_eq!(def.dependencies, vec!["a", "b"]);
    }

    #[test]
    fn test_version_helpers() {
        assert!(is_valid_version("20240101T120000_create_users"));
        assert!(!is_valid_version("20240101_create_users"));
        assert!(!is_valid_version("20240101T120000_"));
        assert!(!is_valid_version("20240101T120000_Upper"));
        assert_eq!(parse_version(FILE), Some("20240101T120000_create_users"));
        assert_eq!(parse_version("20240101T120000_create_users.txt"), None);

        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(new_version(now, "Add Email Column!"), "20240305T070809_add_email_column");
        assert_eq!(slugify("  --  "), "migration");
    }
}
