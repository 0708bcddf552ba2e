//! Database connection management
//!
//! This module provides the single shared SQLite handle used by the layer.
//! The handle is opened lazily on first access and configured with a fixed
//! pragma sequence tuned for a single-process, read-mostly workload.

use crate::error::{DataError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Tunables applied when the connection is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Negative values are KiB, positive values are pages
    pub cache_size: i64,
    pub busy_timeout_ms: u64,
    pub mmap_size: u64,
    pub page_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            cache_size: -64000,
            busy_timeout_ms: 5000,
            mmap_size: 268_435_456,
            page_size: 4096,
        }
    }
}

/// Storage statistics reported by `stats()`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseStats {
    pub journal_mode: String,
    pub cache_size: i64,
    pub page_size: i64,
    pub page_count: i64,
    pub freelist_count: i64,
    /// Bytes on disk for the main file (0 for in-memory databases)
    pub file_size: u64,
    /// Bytes on disk for the `-wal` sidecar
    pub wal_size: u64,
}

/// Lazily-opened, mutex-guarded SQLite connection
///
/// `ConnectionManager` owns the one handle the process uses. Callers never
/// hold the handle directly; they run closures against it through
/// [`ConnectionManager::with_connection`], so concurrent first calls can
/// never open the database twice.
pub struct ConnectionManager {
    path: Option<PathBuf>,
    settings: ConnectionSettings,
    conn: Mutex<Option<Connection>>,
}

impl ConnectionManager {
    /// Manager for a file-backed database at `path`
    pub fn new(path: impl Into<PathBuf>, settings: ConnectionSettings) -> Self {
        Self {
            path: Some(path.into()),
            settings,
            conn: Mutex::new(None),
        }
    }

    /// Manager for a private in-memory database
    pub fn in_memory() -> Self {
        Self {
            path: None,
            settings: ConnectionSettings::default(),
            conn: Mutex::new(None),
        }
    }

    /// Path of the database file, `None` when in-memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn target(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic inside a closure must not brick the process-wide handle
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the shared connection, opening it on first use
    pub fn with_connection<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
    {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(DataError::Connection {
                target: self.target(),
                reason: "connection unavailable".to_string(),
            }
            .into()),
        }
    }

    /// Open and configure a new handle
    fn open(&self) -> Result<Connection> {
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| DataError::Connection {
                            target: self.target(),
                            reason: format!("Failed to create directory '{}': {}", parent.display(), e),
                        })?;
                    }
                }
                Connection::open(path).map_err(|e| DataError::Connection {
                    target: self.target(),
                    reason: format!("Failed to open database: {}", e),
                })?
            }
            None => Connection::open_in_memory().map_err(|e| DataError::Connection {
                target: self.target(),
                reason: format!("Failed to create in-memory database: {}", e),
            })?,
        };

        self.configure(&conn);
        info!(db = %self.target(), "database connection opened");
        Ok(conn)
    }

    /// Apply the pragma sequence; individual failures are logged and skipped
    fn configure(&self, conn: &Connection) {
        let s = &self.settings;
        let pragmas = [
            ("journal_mode", "WAL".to_string()),
            ("synchronous", "NORMAL".to_string()),
            ("cache_size", s.cache_size.to_string()),
            ("foreign_keys", "ON".to_string()),
            ("busy_timeout", s.busy_timeout_ms.to_string()),
            ("temp_store", "MEMORY".to_string()),
            ("mmap_size", s.mmap_size.to_string()),
            ("page_size", s.page_size.to_string()),
        ];

        for (name, value) in pragmas {
            match run_statement(conn, &format!("PRAGMA {} = {}", name, value)) {
                Ok(()) => debug!("applied PRAGMA {} = {}", name, value),
                Err(e) => warn!("Failed to apply PRAGMA {} = {}: {}", name, value, e),
            }
        }
    }

    /// Drop the handle; the next access reopens it
    pub fn close(&self) {
        let mut guard = self.lock();
        self.close_locked(&mut guard);
    }

    fn close_locked(&self, guard: &mut MutexGuard<'_, Option<Connection>>) {
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close database cleanly: {}", e);
            } else {
                info!(db = %self.target(), "database connection closed");
            }
        }
    }

    /// Close the handle and run `f` while holding it closed
    ///
    /// No other caller can reopen the database until `f` returns, so `f`
    /// may replace the files on disk. `f` receives the database path.
    pub fn with_closed<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Option<&Path>) -> Result<T>,
    {
        let mut guard = self.lock();
        self.close_locked(&mut guard);
        f(self.path())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Report page and file-level statistics
    pub fn stats(&self) -> Result<DatabaseStats> {
        let (journal_mode, cache_size, page_size, page_count, freelist_count) =
            self.with_connection(|conn| {
                let read_text = |pragma: &str| -> Result<String> {
                    conn.query_row(&format!("PRAGMA {}", pragma), [], |row| row.get(0))
                        .map_err(|e| DataError::sqlite(format!("PRAGMA {}", pragma), e))
                };
                let read_int = |pragma: &str| -> Result<i64> {
                    conn.query_row(&format!("PRAGMA {}", pragma), [], |row| row.get(0))
                        .map_err(|e| DataError::sqlite(format!("PRAGMA {}", pragma), e))
                };
                Ok::<_, DataError>((
                    read_text("journal_mode")?,
                    read_int("cache_size")?,
                    read_int("page_size")?,
                    read_int("page_count")?,
                    read_int("freelist_count")?,
                ))
            })?;

        let (file_size, wal_size) = match &self.path {
            Some(path) => (file_len(path), file_len(&sidecar(path, "-wal"))),
            None => (0, 0),
        };

        Ok(DatabaseStats {
            journal_mode,
            cache_size,
            page_size,
            page_count,
            freelist_count,
            file_size,
            wal_size,
        })
    }

    /// Refresh planner statistics, truncate the WAL and compact the file
    pub fn optimize(&self) -> Result<()> {
        self.with_connection(|conn| {
            for sql in [
                "PRAGMA optimize",
                "ANALYZE",
                "PRAGMA wal_checkpoint(TRUNCATE)",
                "VACUUM",
            ] {
                run_statement(conn, sql).map_err(|e| DataError::sqlite(sql, e))?;
            }
            Ok::<_, DataError>(())
        })?;
        info!("database optimized");
        Ok(())
    }

    /// Fold the WAL back into the main file
    pub fn checkpoint(&self) -> Result<()> {
        self.with_connection(|conn| {
            run_statement(conn, "PRAGMA wal_checkpoint(TRUNCATE)")
                .map_err(|e| DataError::sqlite("checkpoint", e))
        })
    }

    /// Whether a trivial statement round-trips
    pub fn health_check(&self) -> bool {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| DataError::sqlite("health check", e))
        })
        .map(|v| v == 1)
        .unwrap_or_else(|e| {
            warn!("database health check failed: {}", e);
            false
        })
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        self.with_connection(|conn| table_exists(conn, table_name))
    }

    /// Get the row count for a table
    pub fn table_count(&self, table_name: &str) -> Result<u64> {
        crate::query::validate_identifier(table_name)?;
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", table_name),
                [],
                |row| row.get::<_, u64>(0),
            )
            .map_err(|e| DataError::sqlite(format!("count on {}", table_name), e))
        })
    }
}

/// Step a statement once, discarding any row it answers with
///
/// Some pragmas report their new value as a row and others return nothing.
fn run_statement(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    rows.next()?;
    Ok(())
}

/// Check if a table exists on an already-borrowed connection
pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table_name],
            |row| row.get(0),
        )
        .map_err(|e| DataError::sqlite("table lookup", e))?;
    Ok(count > 0)
}

/// `<db>-wal` / `<db>-shm` next to the database file
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lazy_open() {
        let manager = ConnectionManager::in_memory();
        assert!(!manager.is_open());
        assert!(manager.health_check());
        assert!(manager.is_open());

        manager.close();
        assert!(!manager.is_open());
    }

    #[test]
    fn test_file_database_pragmas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let manager = ConnectionManager::new(&path, ConnectionSettings::default());

        let stats = manager.stats().unwrap();
        assert_eq!(stats.journal_mode.to_lowercase(), "wal");
        assert_eq!(stats.cache_size, -64000);
        assert!(path.exists());

        let fk: i64 = manager
            .with_connection(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| DataError::sqlite("pragma", e))
            })
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_table_helpers() {
        let manager = ConnectionManager::in_memory();
        manager
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE test_table (id INTEGER PRIMARY KEY);
                     INSERT INTO test_table (id) VALUES (1), (2), (3);",
                )
                .map_err(|e| DataError::sqlite("setup", e))
            })
            .unwrap();

        assert!(manager.table_exists("test_table").unwrap());
        assert!(!manager.table_exists("nonexistent_table").unwrap());
        assert_eq!(manager.table_count("test_table").unwrap(), 3);
        assert!(manager.table_count("test_table; DROP").is_err());
    }

    #[test]
    fn test_optimize_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConnectionManager::new(dir.path().join("data.db"), ConnectionSettings::default());
        manager
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('a');")
                    .map_err(|e| DataError::sqlite("setup", e))
            })
            .unwrap();
        manager.checkpoint().unwrap();
        manager.optimize().unwrap();
        assert_eq!(manager.table_count("t").unwrap(), 1);
    }

    #[test]
    fn test_with_closed_blocks_reopening() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ConnectionManager::new(
            dir.path().join("data.db"),
            ConnectionSettings::default(),
        ));
        assert!(manager.health_check());

        let (tx, rx) = mpsc::channel();
        let other = manager.clone();
        let reader = manager
            .with_closed(|path| {
                assert!(path.is_some());
                let reader = std::thread::spawn(move || {
                    let healthy = other.health_check();
                    tx.send(healthy).unwrap();
                });
                // the reader waits for the handle instead of reopening the file
                assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
                Ok(reader)
            })
            .unwrap();
        reader.join().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(manager.is_open());
    }

    #[test]
    fn test_open_failure_is_connection_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let manager =
            ConnectionManager::new(blocker.join("data.db"), ConnectionSettings::default());
        let err = manager.with_connection(|_| Ok::<_, DataError>(())).unwrap_err();
        assert!(matches!(err, DataError::Connection { .. }));
    }
}
