//! Transaction management
//!
//! Closure-scoped transactions over the shared connection. The closure's
//! result decides the outcome: `Ok` commits, `Err` rolls back and the
//! original error is returned unchanged. Nesting is expressed with
//! savepoints on the [`Transaction`] handed to the closure.

use super::connection::ConnectionManager;
use crate::error::{DataError, Result};
use crate::query::validate_identifier;
use rusqlite::Connection;
use std::cell::Cell;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

/// SQLite transaction locking behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Locks are taken on first read/write
    Deferred,
    /// Write lock taken at BEGIN
    Immediate,
    /// Exclusive lock taken at BEGIN
    Exclusive,
}

impl TransactionMode {
    fn begin_sql(&self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN DEFERRED",
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Runs closures inside top-level transactions on the shared connection
#[derive(Clone)]
pub struct TransactionManager {
    connection: Arc<ConnectionManager>,
}

impl TransactionManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Deferred transaction
    pub fn execute<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
    {
        self.run(TransactionMode::Deferred, f)
    }

    /// Transaction holding the write lock from the start
    pub fn execute_immediate<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
    {
        self.run(TransactionMode::Immediate, f)
    }

    pub fn execute_exclusive<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
    {
        self.run(TransactionMode::Exclusive, f)
    }

    fn run<T, E, F>(&self, mode: TransactionMode, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
    {
        self.connection
            .with_connection(|conn| Transaction::run(conn, mode, f))
    }
}

/// An open transaction on a borrowed connection
///
/// Dereferences to the underlying [`Connection`] so statements can be run
/// directly. If the transaction is dropped without being finished (a panic
/// unwinding through the closure) it is rolled back.
pub struct Transaction<'c> {
    conn: &'c Connection,
    depth: Cell<u32>,
    finished: Cell<bool>,
}

impl<'c> Transaction<'c> {
    /// Begin a transaction on `conn`, run `f`, then commit or roll back
    ///
    /// Used directly by components that already hold the connection.
    pub fn run<T, E, F>(conn: &'c Connection, mode: TransactionMode, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'c>) -> std::result::Result<T, E>,
    {
        conn.execute_batch(mode.begin_sql())
            .map_err(|e| DataError::sqlite("begin transaction", e))?;
        let tx = Transaction {
            conn,
            depth: Cell::new(0),
            finished: Cell::new(false),
        };

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    fn commit(&self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| DataError::sqlite("commit", e))?;
        self.finished.set(true);
        debug!("transaction committed");
        Ok(())
    }

    fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Failed to roll back transaction: {}", e);
        } else {
            debug!("transaction rolled back");
        }
        self.finished.set(true);
    }

    /// Run `f` inside an automatic savepoint
    ///
    /// On `Err` only the work done inside `f` is undone and the error is
    /// returned to the caller, who may handle it and continue the outer
    /// transaction.
    pub fn execute<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<DataError>,
        F: FnOnce(&Transaction<'c>) -> std::result::Result<T, E>,
    {
        let depth = self.depth.get() + 1;
        let name = format!("sp_{}", depth);
        self.exec_savepoint_sql("SAVEPOINT", &name)?;
        self.depth.set(depth);

        let result = f(self);
        self.depth.set(depth - 1);

        match result {
            Ok(value) => {
                self.exec_savepoint_sql("RELEASE SAVEPOINT", &name)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self
                    .exec_savepoint_sql("ROLLBACK TO SAVEPOINT", &name)
                    .and_then(|_| self.exec_savepoint_sql("RELEASE SAVEPOINT", &name))
                {
                    warn!("Failed to unwind savepoint {}: {}", name, rb);
                }
                Err(e)
            }
        }
    }

    /// Create a named checkpoint inside the transaction
    pub fn savepoint(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        self.exec_savepoint_sql("SAVEPOINT", name)
    }

    /// Discard a named checkpoint, keeping its work
    pub fn release(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        self.exec_savepoint_sql("RELEASE SAVEPOINT", name)
    }

    /// Undo everything after the named checkpoint; the checkpoint stays open
    pub fn rollback_to(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        self.exec_savepoint_sql("ROLLBACK TO SAVEPOINT", name)
    }

    fn exec_savepoint_sql(&self, verb: &str, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("{} \"{}\"", verb, name))
            .map_err(|e| DataError::sqlite(format!("{} {}", verb.to_lowercase(), name), e))
    }

    pub fn connection(&self) -> &'c Connection {
        self.conn
    }
}

impl Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            warn!("transaction dropped without commit; rolling back");
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
