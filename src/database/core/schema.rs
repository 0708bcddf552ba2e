//! Layer-owned schema management
//!
//! The data-access layer keeps its own bookkeeping tables next to the
//! application's tables: applied schema migrations, the raw-SQL audit trail
//! and the persisted backend configurations. They are created here before
//! anything else touches the database.

use crate::error::{DataError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Current layer schema version
/// Increment this when making breaking changes to the layer tables
pub const SCHEMA_VERSION: u32 = 1;

/// Tables the layer owns; application rules never grant access to them
pub const LAYER_TABLES: &[&str] = &[
    "polystore_meta",
    "schema_migrations",
    "query_history",
    "database_configs",
];

/// Schema definitions for the layer tables
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    /// SQL for creating the meta table (tracks layer schema version)
    pub const META_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS polystore_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
    "#;

    /// Applied application migrations, one row per version
    pub const SCHEMA_MIGRATIONS_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#;

    /// Audit trail for the raw-SQL escape hatch
    pub const QUERY_HISTORY_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS query_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sql TEXT NOT NULL,
            user_id TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            success INTEGER NOT NULL,
            error TEXT,
            executed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#;

    /// Persisted backend configurations; at most one is active
    pub const DATABASE_CONFIGS_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS database_configs (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            config TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#;

    pub const INDEXES: &'static [&'static str] = &[
        "CREATE INDEX IF NOT EXISTS idx_query_history_executed_at ON query_history(executed_at)",
        "CREATE INDEX IF NOT EXISTS idx_database_configs_active ON database_configs(is_active)",
    ];
}

/// Schema manager for the layer tables
///
/// Handles initialization, version checking and integrity verification.
pub struct SchemaManager<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaManager<'a> {
    /// Create a new schema manager for the given connection
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create all layer tables and indexes if they don't exist
    pub fn initialize(&self) -> Result<()> {
        let tables = [
            ("polystore_meta", SchemaDefinitions::META_TABLE),
            ("schema_migrations", SchemaDefinitions::SCHEMA_MIGRATIONS_TABLE),
            ("query_history", SchemaDefinitions::QUERY_HISTORY_TABLE),
            ("database_configs", SchemaDefinitions::DATABASE_CONFIGS_TABLE),
        ];
        for (name, sql) in tables {
            self.conn
                .execute(sql, [])
                .map_err(|e| DataError::sqlite(format!("create {} table", name), e))?;
        }

        for index_sql in SchemaDefinitions::INDEXES {
            self.conn
                .execute(index_sql, [])
                .map_err(|e| DataError::sqlite("create layer index", e))?;
        }

        self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
        Ok(())
    }

    /// Check the current schema status
    pub fn check_status(&self) -> Result<SchemaStatus> {
        if !super::connection::table_exists(self.conn, "polystore_meta")? {
            return Ok(SchemaStatus::NotInitialized);
        }

        let current_version = self.get_schema_version()?;

        if current_version == SCHEMA_VERSION {
            if self.verify_integrity()? {
                Ok(SchemaStatus::Current)
            } else {
                Ok(SchemaStatus::Corrupted)
            }
        } else if current_version < SCHEMA_VERSION {
            Ok(SchemaStatus::NeedsMigration {
                from: current_version,
                to: SCHEMA_VERSION,
            })
        } else {
            // Database is from a newer version
            Ok(SchemaStatus::Incompatible {
                database_version: current_version,
                required_version: SCHEMA_VERSION,
            })
        }
    }

    fn get_schema_version(&self) -> Result<u32> {
        let version = self.get_meta("schema_version")?.unwrap_or_else(|| "0".to_string());
        version
            .parse()
            .map_err(|e| DataError::Config(format!("Invalid schema version '{}': {}", version, e)))
    }

    fn verify_integrity(&self) -> Result<bool> {
        for table in LAYER_TABLES {
            if !super::connection::table_exists(self.conn, table)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Set a metadata value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO polystore_meta (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))",
                [key, value],
            )
            .map_err(|e| DataError::sqlite("set meta value", e))?;
        Ok(())
    }

    /// Get a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM polystore_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| DataError::sqlite("get meta value", e))
    }
}

/// Status of the layer schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is current and valid
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },

    /// Schema is corrupted (missing tables)
    Corrupted,
}

impl Display for SchemaStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaStatus::NotInitialized => write!(f, "not initialized"),
            SchemaStatus::Current => write!(f, "current (v{})", SCHEMA_VERSION),
            SchemaStatus::NeedsMigration { from, to } => write!(f, "needs migration v{} -> v{}", from, to),
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => write!(
                f,
                "incompatible (database v{}, this build v{})",
                database_version, required_version
            ),
            SchemaStatus::Corrupted => write!(f, "corrupted (layer tables missing)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn create_test_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_schema_not_initialized() {
        let conn = create_test_db();
        let manager = SchemaManager::new(&conn);

        assert_eq!(
            manager.check_status().unwrap(),
            SchemaStatus::NotInitialized
        );
    }

    #[test]
    fn test_schema_initialize_is_idempotent() {
        let conn = create_test_db();
        let manager = SchemaManager::new(&conn);

        manager.initialize().unwrap();
        manager.initialize().unwrap();

        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Current);
        assert_eq!(manager.get_schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_missing_table_is_corrupted() {
        let conn = create_test_db();
        let manager = SchemaManager::new(&conn);
        manager.initialize().unwrap();

        conn.execute("DROP TABLE query_history", []).unwrap();
        assert_eq!(manager.check_status().unwrap(), SchemaStatus::Corrupted);
    }

    #[test]
    fn test_meta_operations() {
        let conn = create_test_db();
        let manager = SchemaManager::new(&conn);

        manager.initialize().unwrap();

        manager.set_meta("test_key", "test_value").unwrap();
        let value = manager.get_meta("test_key").unwrap();
        assert_eq!(value, Some("test_value".to_string()));

        let missing = manager.get_meta("nonexistent").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_newer_database_is_incompatible() {
        let conn = create_test_db();
        let manager = SchemaManager::new(&conn);
        manager.initialize().unwrap();
        manager.set_meta("schema_version", "99").unwrap();

        let status = manager.check_status().unwrap();
        assert_eq!(
            status,
            SchemaStatus::Incompatible {
                database_version: 99,
                required_version: SCHEMA_VERSION,
            }
        );
        assert!(status.to_string().starts_with("incompatible"));
    }
}
