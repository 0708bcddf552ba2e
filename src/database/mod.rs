//! Database module
//!
//! Everything that touches the embedded SQLite database directly:
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── connection  # ConnectionManager (lazy open, pragmas, stats)
//! │   ├── transaction # TransactionManager, savepoints
//! │   └── schema      # layer-owned tables
//! │
//! ├── migration       # versioned application schema migrations
//! └── backup          # file-level snapshots via the online backup API
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use polystore::database::{builtin_migrations, ConnectionManager, MigrationManager};
//! use std::sync::Arc;
//!
//! let conn = Arc::new(ConnectionManager::in_memory());
//! let mut migrations = MigrationManager::new(conn.clone())?;
//! for m in builtin_migrations() {
//!     migrations.register(m)?;
//! }
//! let applied = migrations.migrate()?;
//! ```

pub mod backup;
pub mod core;
pub mod migration;

pub use backup::{BackupInfo, BackupManager, BackupOptions};
pub use core::{
    ConnectionManager, ConnectionSettings, DatabaseStats, SchemaDefinitions, SchemaManager,
    SchemaStatus, Transaction, TransactionManager, TransactionMode, LAYER_TABLES, SCHEMA_VERSION,
};
pub use migration::{builtin_migrations, AppliedMigration, Migration, MigrationManager};
