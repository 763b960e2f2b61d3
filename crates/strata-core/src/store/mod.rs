//! Durable storage for migration scripts and backup artifacts.

pub mod compression;
mod script_store;

pub use compression::{has_gzip_magic, is_gzip_path, GZIP_EXTENSION};
pub use script_store::{version_token, ScriptStore, MIGRATION_EXTENSION};
