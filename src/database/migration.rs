//! Versioned schema migrations
//!
//! Migrations are registered in code, applied in ascending version order and
//! recorded in `schema_migrations`. Each one runs in its own `BEGIN IMMEDIATE`
//! transaction and its version is only recorded after `up` succeeded, so a
//! failed run leaves the database at the last good version.

use super::core::{ConnectionManager, SchemaManager, SchemaStatus, Transaction, TransactionMode};
use crate::error::{DataError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

type MigrationFn = Box<dyn Fn(&Connection) -> anyhow::Result<()> + Send + Sync>;

/// A single reversible schema change
pub struct Migration {
    pub version: u32,
    pub name: String,
    up: MigrationFn,
    down: MigrationFn,
}

impl Migration {
    pub fn new<U, D>(version: u32, name: impl Into<String>, up: U, down: D) -> Self
    where
        U: Fn(&Connection) -> anyhow::Result<()> + Send + Sync + 'static,
        D: Fn(&Connection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            version,
            name: name.into(),
            up: Box::new(up),
            down: Box::new(down),
        }
    }

    /// A migration expressed as two SQL batches
    pub fn sql(version: u32, name: impl Into<String>, up: &'static str, down: &'static str) -> Self {
        Self::new(
            version,
            name,
            move |conn| Ok(conn.execute_batch(up)?),
            move |conn| Ok(conn.execute_batch(down)?),
        )
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// A row of `schema_migrations`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[cfg_attr(feature = "display", derive(tabled::Tabled))]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub applied_at: String,
}

pub struct MigrationManager {
    connection: Arc<ConnectionManager>,
    migrations: BTreeMap<u32, Migration>,
}

impl MigrationManager {
    /// Create a manager, ensuring the layer tables exist
    pub fn new(connection: Arc<ConnectionManager>) -> Result<Self> {
        connection.with_connection(|conn| {
            let schema = SchemaManager::new(conn);
            if let SchemaStatus::Incompatible {
                database_version,
                required_version,
            } = schema.check_status()?
            {
                return Err(DataError::Migration {
                    version: database_version,
                    name: "layer schema".to_string(),
                    reason: format!("database was written by a newer release (this build supports v{})", required_version),
                });
            }
            schema.initialize()
        })?;
        Ok(Self {
            connection,
            migrations: BTreeMap::new(),
        })
    }

    /// Register a migration; versions must be unique and non-zero
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if migration.version == 0 || self.migrations.contains_key(&migration.version) {
            return Err(DataError::Migration {
                version: migration.version,
                name: migration.name.clone(),
                reason: "version must be unique and greater than zero".to_string(),
            });
        }
        self.migrations.insert(migration.version, migration);
        Ok(())
    }

    /// Highest applied version, 0 when none
    pub fn current_version(&self) -> Result<u32> {
        self.connection.with_connection(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| DataError::sqlite("read current schema version", e))
        })
    }

    /// Registered migrations not yet applied, in version order
    pub fn pending_migrations(&self) -> Result<Vec<(u32, String)>> {
        let applied: BTreeSet<u32> = self
            .applied_migrations()?
            .into_iter()
            .map(|m| m.version)
            .collect();
        Ok(self
            .migrations
            .values()
            .filter(|m| !applied.contains(&m.version))
            .map(|m| (m.version, m.name.clone()))
            .collect())
    }

    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        self.connection.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")
                .map_err(|e| DataError::sqlite("list applied migrations", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(AppliedMigration {
                        version: row.get(0)?,
                        name: row.get(1)?,
                        applied_at: row.get(2)?,
                    })
                })
                .map_err(|e| DataError::sqlite("list applied migrations", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DataError::sqlite("list applied migrations", e))
        })
    }

    /// Apply every pending migration in order, returning the applied versions
    ///
    /// Stops at the first failure; earlier migrations in the same run stay applied.
    pub fn migrate(&self) -> Result<Vec<u32>> {
        let pending = self.pending_migrations()?;
        if pending.is_empty() {
            debug!("schema is up to date");
            return Ok(Vec::new());
        }

        let mut applied = Vec::with_capacity(pending.len());
        for (version, _) in pending {
            let Some(migration) = self.migrations.get(&version) else {
                continue;
            };
            debug!("applying migration v{:03}: {}", version, migration.name);

            self.connection.with_connection(|conn| {
                Transaction::run(conn, TransactionMode::Immediate, |tx| {
                    (migration.up)(tx.connection()).map_err(|e| DataError::Migration {
                        version,
                        name: migration.name.clone(),
                        reason: e.to_string(),
                    })?;
                    tx.connection()
                        .execute(
                        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                        rusqlite::params![version, migration.name],
                    )
                    .map_err(|e| DataError::sqlite(format!("record migration v{}", version), e))?;
                    Ok::<_, DataError>(())
                })
            })
            .map_err(|e| {
                error!("migration v{:03} failed: {}", version, e);
                e
            })?;

            info!("applied migration v{:03}: {}", version, migration.name);
            applied.push(version);
        }
        Ok(applied)
    }

    /// Revert the most recently applied migration
    ///
    /// Returns the reverted version, or `None` when nothing is applied.
    pub fn rollback(&self) -> Result<Option<u32>> {
        let version = self.current_version()?;
        if version == 0 {
            return Ok(None);
        }
        let migration = self.migrations.get(&version).ok_or_else(|| DataError::Migration {
            version,
            name: String::new(),
            reason: "applied migration is not registered; cannot roll back".to_string(),
        })?;

        self.connection.with_connection(|conn| {
            Transaction::run(conn, TransactionMode::Immediate, |tx| {
                (migration.down)(tx.connection()).map_err(|e| DataError::Migration {
                    version,
                    name: migration.name.clone(),
                    reason: format!("rollback failed: {}", e),
                })?;
                tx.connection()
                    .execute(
                    "DELETE FROM schema_migrations WHERE version = ?1",
                    [version],
                )
                .map_err(|e| DataError::sqlite(format!("unrecord migration v{}", version), e))?;
                Ok::<_, DataError>(())
            })
        })?;

        info!("rolled back migration v{:03}: {}", version, migration.name);
        Ok(Some(version))
    }
}

// =============================================================================
// Application schema
// =============================================================================

const V1_UP: &str = r#"
    CREATE TABLE profiles (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        full_name TEXT,
        category TEXT NOT NULL DEFAULT 'member',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE TABLE user_roles (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        role TEXT NOT NULL DEFAULT 'member',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
"#;

const V1_DOWN: &str = r#"
    DROP TABLE IF EXISTS user_roles;
    DROP TABLE IF EXISTS profiles;
"#;

const V2_UP: &str = r#"
    CREATE TABLE projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'open',
        creator_id TEXT NOT NULL,
        budget REAL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE TABLE project_applications (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        applicant_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        message TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
"#;

const V2_DOWN: &str = r#"
    DROP TABLE IF EXISTS project_applications;
    DROP TABLE IF EXISTS projects;
"#;

const V3_UP: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_user_roles_user_id ON user_roles(user_id);
    CREATE INDEX IF NOT EXISTS idx_projects_creator_id ON projects(creator_id);
    CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);
    CREATE INDEX IF NOT EXISTS idx_project_applications_project_id ON project_applications(project_id);
    CREATE INDEX IF NOT EXISTS idx_project_applications_applicant_id ON project_applications(applicant_id);
"#;

const V3_DOWN: &str = r#"
    DROP INDEX IF EXISTS idx_project_applications_applicant_id;
    DROP INDEX IF EXISTS idx_project_applications_project_id;
    DROP INDEX IF EXISTS idx_projects_status;
    DROP INDEX IF EXISTS idx_projects_creator_id;
    DROP INDEX IF EXISTS idx_user_roles_user_id;
"#;

/// The application schema shipped with the layer
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::sql(1, "create_profiles_and_roles", V1_UP, V1_DOWN),
        Migration::sql(2, "create_projects_and_applications", V2_UP, V2_DOWN),
        Migration::sql(3, "add_lookup_indexes", V3_UP, V3_DOWN),
    ]
}
