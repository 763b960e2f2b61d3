//! The target relational store and script execution against it.

mod sqlite;
pub mod statement;
mod value;

pub use sqlite::{list_tables, table_columns, table_exists, TargetStore};
pub use statement::{execute_script, quote_ident, split_statements, StatementFailure};
pub use value::SqlValue;
