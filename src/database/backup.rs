//! File-level backups of the embedded database
//!
//! Snapshots are taken with SQLite's online backup API, so writers are not
//! blocked for the duration of the copy. Restoring replaces the database file
//! wholesale; the live connection is closed first and reopened on next use.

use super::core::{sidecar, ConnectionManager};
use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const BACKUP_PREFIX: &str = "backup-";
const BACKUP_EXTENSION: &str = ".db";
/// Pages copied per backup step
const PAGES_PER_STEP: std::os::raw::c_int = 100;

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Appended to the generated file name; `[A-Za-z0-9_-]` only
    pub label: Option<String>,
}

/// A snapshot file on disk
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct BackupManager {
    connection: Arc<ConnectionManager>,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(connection: Arc<ConnectionManager>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            connection,
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn backup_err(path: &Path, reason: impl ToString) -> DataError {
        DataError::Backup {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Snapshot the live database into the backup directory
    pub fn create_backup(&self, options: BackupOptions) -> Result<BackupInfo> {
        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|e| Self::backup_err(&self.backup_dir, format!("Failed to create backup directory: {}", e)))?;

        let now = Utc::now();
        let mut filename = format!("{}{}", BACKUP_PREFIX, now.format("%Y%m%d-%H%M%S%3f"));
        if let Some(label) = &options.label {
            let valid = !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(Self::backup_err(
                    &self.backup_dir,
                    format!("invalid backup label '{}'", label),
                ));
            }
            filename.push('-');
            filename.push_str(label);
        }
        filename.push_str(BACKUP_EXTENSION);
        let path = self.backup_dir.join(&filename);

        self.connection.with_connection(|src| {
            let mut dst = Connection::open(&path)
                .map_err(|e| Self::backup_err(&path, format!("Failed to open backup file: {}", e)))?;
            let backup = Backup::new(src, &mut dst)
                .map_err(|e| Self::backup_err(&path, format!("Failed to start backup: {}", e)))?;
            backup
                .run_to_completion(PAGES_PER_STEP, Duration::ZERO, None)
                .map_err(|e| Self::backup_err(&path, format!("Backup did not complete: {}", e)))
        })?;

        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!("created backup {} ({} bytes)", path.display(), size_bytes);

        Ok(BackupInfo {
            filename,
            path,
            size_bytes,
            created_at: now,
        })
    }

    /// Replace the live database with the snapshot at `path`
    ///
    /// The snapshot is checked for integrity before anything is touched.
    pub fn restore_backup(&self, path: &Path) -> Result<()> {
        let target = self
            .connection
            .path()
            .ok_or_else(|| Self::backup_err(path, "cannot restore into an in-memory database"))?
            .to_path_buf();

        if !path.is_file() {
            return Err(Self::backup_err(path, "backup file not found"));
        }
        verify_snapshot(path)?;

        self.connection.with_closed(|_| {
            for suffix in ["-wal", "-shm"] {
                let side = sidecar(&target, suffix);
                if side.exists() {
                    std::fs::remove_file(&side).map_err(|e| {
                        Self::backup_err(&side, format!("Failed to remove sidecar file: {}", e))
                    })?;
                }
            }
            std::fs::copy(path, &target).map_err(|e| {
                Self::backup_err(path, format!("Failed to copy backup into place: {}", e))
            })?;
            Ok(())
        })?;

        info!("restored database from {}", path.display());
        Ok(())
    }

    /// Snapshots in the backup directory, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.backup_dir)
            .map_err(|e| Self::backup_err(&self.backup_dir, format!("Failed to read backup directory: {}", e)))?;

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(BACKUP_PREFIX) || !filename.ends_with(BACKUP_EXTENSION) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupInfo {
                filename,
                path: entry.path(),
                size_bytes: metadata.len(),
                created_at,
            });
        }

        // The timestamp prefix sorts chronologically
        backups.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(backups)
    }

    /// Delete all but the `keep` newest snapshots; returns how many were removed
    pub fn clean_old_backups(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for backup in self.list_backups()?.into_iter().skip(keep) {
            match std::fs::remove_file(&backup.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove old backup {}: {}", backup.path.display(), e),
            }
        }
        if removed > 0 {
            info!("removed {} old backup(s)", removed);
        }
        Ok(removed)
    }

    /// Take a snapshot every `interval` and prune to `keep`, until the handle is aborted
    pub fn schedule_backups(
        self: &Arc<Self>,
        interval: Duration,
        keep: usize,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let worker = Arc::clone(&manager);
                let outcome = tokio::task::spawn_blocking(move || {
                    worker.create_backup(BackupOptions {
                        label: Some("scheduled".to_string()),
                    })?;
                    worker.clean_old_backups(keep)
                })
                .await;
                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("scheduled backup failed: {}", e),
                    Err(e) => error!("scheduled backup task panicked: {}", e),
                }
            }
        })
    }
}

fn verify_snapshot(path: &Path) -> Result<()> {
    let check = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .and_then(|conn| conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0)));
    match check {
        Ok(result) if result == "ok" => Ok(()),
        Ok(result) => Err(BackupManager::backup_err(path, format!("integrity check failed: {}", result))),
        Err(e) => Err(BackupManager::backup_err(path, format!("not a readable database: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::ConnectionSettings;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<ConnectionManager>, BackupManager) {
        let conn = Arc::new(ConnectionManager::new(
            dir.path().join("data.db"),
            ConnectionSettings::default(),
        ));
        conn.with_connection(|c| {
            c.execute_batch(
                "CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('first');",
            )
            .map_err(|e| DataError::sqlite("setup", e))
        })
        .unwrap();
        let backups = BackupManager::new(conn.clone(), dir.path().join("backups"));
        (conn, backups)
    }

    #[test]
    fn test_create_and_restore() {
        let dir = TempDir::new().unwrap();
        let (conn, backups) = setup(&dir);

        let info = backups
            .create_backup(BackupOptions {
                label: Some("pre-change".to_string()),
            })
            .unwrap();
        assert!(info.filename.starts_with("backup-"));
        assert!(info.filename.ends_with("-pre-change.db"));
        assert!(info.size_bytes > 0);

        conn.with_connection(|c| {
            c.execute_batch("INSERT INTO notes VALUES ('second');")
                .map_err(|e| DataError::sqlite("insert", e))
        })
        .unwrap();
        assert_eq!(conn.table_count("notes").unwrap(), 2);

        backups.restore_backup(&info.path).unwrap();
        assert!(!conn.is_open());
        assert_eq!(conn.table_count("notes").unwrap(), 1);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let (conn, backups) = setup(&dir);

        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, b"definitely not sqlite").unwrap();
        let err = backups.restore_backup(&bogus).unwrap_err();
        assert!(matches!(err, DataError::Backup { .. }));
        // live database untouched
        assert_eq!(conn.table_count("notes").unwrap(), 1);

        let err = backups.restore_backup(&dir.path().join("missing.db")).unwrap_err();
        assert!(matches!(err, DataError::Backup { .. }));
    }

    #[test]
    fn test_list_and_clean() {
        let dir = TempDir::new().unwrap();
        let (_conn, backups) = setup(&dir);
        assert!(backups.list_backups().unwrap().is_empty());

        for _ in 0..3 {
            backups.create_backup(BackupOptions::default()).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].filename > listed[2].filename);

        assert_eq!(backups.clean_old_backups(1).unwrap(), 2);
        let remaining = backups.list_backups().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].filename, listed[0].filename);
    }

    #[test]
    fn test_invalid_label() {
        let dir = TempDir::new().unwrap();
        let (_conn, backups) = setup(&dir);
        let err = backups
            .create_backup(BackupOptions {
                label: Some("../escape".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, DataError::Backup { .. }));
    }

    #[tokio::test]
    async fn test_scheduled_backups() {
        let dir = TempDir::new().unwrap();
        let (_conn, backups) = setup(&dir);
        let backups = Arc::new(backups);

        let handle = backups.schedule_backups(Duration::from_millis(50), 2);
        tokio::time::sleep(Duration::from_millis(280)).await;
        handle.abort();

        let listed = backups.list_backups().unwrap();
        assert!(!listed.is_empty());
        assert!(listed.len() <= 2);
    }
}
