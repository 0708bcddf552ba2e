#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Polystore - a vendor-neutral data-access and governance layer
//!
//! Application code describes reads and writes as a backend-neutral
//! [`UniversalQuery`]; polystore authorizes it, runs trigger-style event
//! handlers around it, executes it on whichever storage backend is active
//! and records how long it took. The active backend can be replaced at
//! runtime by copying every application table into the new one first.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | `postgres` | PostgreSQL adapter | `tokio-postgres` |
//! | `display` | Table formatting for reports | `tabled` |
//! | `cli` | The `polystore` administration binary | All above + `clap`, `tracing-subscriber` |
//!
//! # Architecture
//!
//! - **[`query`]**: the universal query model, identifier validation and
//!   the parameterized SQL builder
//! - **[`adapter`]**: one [`DataAdapter`] per backend (SQLite, PostgreSQL,
//!   MySQL, MongoDB Data API, Supabase REST, Firestore) plus the registry
//! - **[`security`]**: declarative per-table rules with query rewriting
//! - **[`events`]**: before/after hooks and the stock trigger handlers
//! - **[`monitoring`]**: performance metrics, health and alerting
//! - **[`database`]**: the embedded SQLite database, schema migrations and
//!   file snapshots
//! - **[`manager`]**: the [`DataAccessManager`] facade tying it together
//! - **[`config`]**: configuration file and environment handling
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use polystore::{DataAccessManager, PolystoreConfig};
//! use polystore::query::UniversalQuery;
//! use polystore::security::User;
//!
//! let config = PolystoreConfig::new(&None)?;
//! let manager = DataAccessManager::open(&config).await?;
//!
//! let alice = User::member("alice");
//! let mine = manager
//!     .query(UniversalQuery::select("projects").limit(20), &alice)
//!     .await?;
//! // members only ever see their own projects
//! for project in mine.rows() {
//!     println!("{}", project["name"]);
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod manager;
pub mod monitoring;
pub mod query;
pub mod security;

pub use adapter::{BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport};
pub use config::PolystoreConfig;
pub use error::{DataError, Result};
pub use events::{DatabaseEvent, EventBus, Timing};
pub use manager::{DataAccessManager, DatabaseConfig, MigrationPhase, MigrationReport};
pub use monitoring::{HealthState, MonitoringService};
pub use query::{Condition, Operation, Operator, UniversalQuery};
pub use security::{PermissionRule, Role, SecurityEngine, User};
