//! Error taxonomy for the data-access layer
//!
//! Every failure that crosses a component boundary is expressed as a
//! [`DataError`]. Backend-specific errors never escape an adapter; they are
//! wrapped into [`DataError::Adapter`] together with the provider and the
//! operation context so callers can log and classify them uniformly.

use crate::adapter::Provider;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = DataError> = std::result::Result<T, E>;

/// Errors raised by the data-access layer
#[derive(Error, Debug)]
pub enum DataError {
    /// The embedded database (or a remote backend) could not be opened
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// The caller sent a query shape the layer does not understand
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// An update or delete was issued without any `where` condition
    #[error("refusing {operation} on '{collection}' without a where condition")]
    MissingPredicate {
        collection: String,
        operation: String,
    },

    /// Authorization failed
    #[error("permission denied for {operation} on '{collection}': {reason}")]
    PermissionDenied {
        collection: String,
        operation: String,
        reason: String,
    },

    /// A table, column or savepoint name failed identifier validation
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// A backend-specific failure, wrapped with context
    #[error("{provider} adapter failed during {context}: {source}")]
    Adapter {
        provider: Provider,
        context: String,
        /// Whether retrying the same request may succeed (lock contention, busy)
        transient: bool,
        #[source]
        source: anyhow::Error,
    },

    /// A schema migration failed; the run stopped at the last good version
    #[error("migration v{version} ({name}) failed: {reason}")]
    Migration {
        version: u32,
        name: String,
        reason: String,
    },

    /// A `before` event handler vetoed the pending write
    #[error("handler on '{channel}' rejected the operation: {reason}")]
    HandlerRejected { channel: String, reason: String },

    /// Creating, listing or restoring a backup artifact failed
    #[error("backup error at '{path}': {reason}")]
    Backup { path: String, reason: String },

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// Wrap a backend failure with provider and operation context
    pub fn adapter(
        provider: Provider,
        context: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Adapter {
            provider,
            context: context.into(),
            transient: false,
            source: source.into(),
        }
    }

    /// Wrap a backend failure that may succeed when retried
    pub fn transient(
        provider: Provider,
        context: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Adapter {
            provider,
            context: context.into(),
            transient: true,
            source: source.into(),
        }
    }

    /// Wrap a rusqlite error, flagging lock contention as transient
    pub fn sqlite(context: impl Into<String>, err: rusqlite::Error) -> Self {
        let transient = is_sqlite_busy(&err);
        Self::Adapter {
            provider: Provider::Sqlite,
            context: context.into(),
            transient,
            source: err.into(),
        }
    }

    pub fn missing_predicate(collection: &str, operation: impl ToString) -> Self {
        Self::MissingPredicate {
            collection: collection.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Whether a caller-driven retry might help
    ///
    /// Security and predicate-safety errors can never succeed as written;
    /// only transient adapter failures are eligible.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataError::Adapter {
                transient: true,
                ..
            }
        )
    }

    /// Short machine-readable kind, used as the key in error statistics
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::Connection { .. } => "connection",
            DataError::UnsupportedOperation(_) => "unsupported_operation",
            DataError::MissingPredicate { .. } => "missing_predicate",
            DataError::PermissionDenied { .. } => "permission_denied",
            DataError::InvalidIdentifier(_) => "invalid_identifier",
            DataError::Adapter { .. } => "adapter",
            DataError::Migration { .. } => "migration",
            DataError::HandlerRejected { .. } => "handler_rejected",
            DataError::Backup { .. } => "backup",
            DataError::Config(_) => "config",
        }
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED are the contention codes worth retrying
fn is_sqlite_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(DataError::sqlite("insert on projects", busy).is_retryable());

        let denied = DataError::PermissionDenied {
            collection: "projects".to_string(),
            operation: "delete".to_string(),
            reason: "not owner".to_string(),
        };
        assert!(!denied.is_retryable());
        assert!(!DataError::missing_predicate("projects", "update").is_retryable());
    }

    #[test]
    fn test_error_kinds_and_messages() {
        let err = DataError::adapter(
            Provider::Supabase,
            "select on profiles",
            anyhow::anyhow!("HTTP 500"),
        );
        assert_eq!(err.kind(), "adapter");
        let msg = err.to_string();
        assert!(msg.contains("supabase"));
        assert!(msg.contains("select on profiles"));

        let err = DataError::missing_predicate("projects", "delete");
        assert_eq!(
            err.to_string(),
            "refusing delete on 'projects' without a where condition"
        );
    }
}
