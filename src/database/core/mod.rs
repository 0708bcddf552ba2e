//! Core database infrastructure
//!
//! This module provides the foundational database components used by the layer:
//! - `ConnectionManager`: lazily-opened, configured SQLite handle
//! - `TransactionManager` / `Transaction`: closure-scoped transactions with savepoints
//! - `SchemaManager`: layer table initialization and status

mod connection;
mod schema;
mod transaction;

pub use connection::{ConnectionManager, ConnectionSettings, DatabaseStats};
pub(crate) use connection::{sidecar, table_exists};
pub use schema::{SchemaDefinitions, SchemaManager, SchemaStatus, LAYER_TABLES, SCHEMA_VERSION};
pub use transaction::{Transaction, TransactionManager, TransactionMode};
