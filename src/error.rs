//! Error types and result handling for mssql-cdc-sync.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use mssql_cdc_sync::{Error, Result};
//!
//! fn resolve_key() -> Result<()> {
//!     Err(Error::UnknownKeyColumn {
//!         table: "sales.orders".to_string(),
//!         column: "order_id".to_string(),
//!     })
//! }
//!
//! match resolve_key() {
//!     Ok(()) => println!("Resolved"),
//!     Err(e) if e.is_configuration() => eprintln!("Fix the table config: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for replication operations.
///
/// Any of these aborts the current table cycle only; the orchestrator logs it
/// and moves on to the next table without committing a new position.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration that is not tied to a single table.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file or environment could not be loaded.
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// A setting required by one table's cycle is absent.
    #[error("Table {table}: missing required setting '{field}'")]
    MissingSetting {
        /// Table key (or source table) the setting was needed for
        table: String,
        /// Name of the missing setting
        field: String,
    },

    /// A configured business key column does not exist in the staged schema.
    #[error("Table {table}: key column '{column}' not found in staged columns")]
    UnknownKeyColumn {
        /// Table key
        table: String,
        /// Key column as written in the configuration
        column: String,
    },

    /// The column set changed between chunks of a single bootstrap.
    #[error("Table {table}: schema changed during bootstrap: {message}")]
    SchemaDrift {
        /// Table key
        table: String,
        /// Description of the difference
        message: String,
    },

    /// A change-log position could not be decoded.
    #[error("Invalid change-log position: {message}")]
    InvalidPosition {
        /// Description of what was invalid
        message: String,
    },

    /// The change source returned something unusable (CDC disabled, unknown
    /// capture instance, malformed change row).
    #[error("Change source error: {message}")]
    Source {
        /// Description of the source failure
        message: String,
    },

    /// The warehouse rejected or did not finish an operation.
    #[error("Warehouse error: {message}")]
    Warehouse {
        /// Description of the warehouse failure
        message: String,
    },

    /// SQL Server client or protocol error.
    #[error("SQL Server error: {0}")]
    SqlServer(#[from] tiberius::error::Error),

    /// BigQuery client error.
    #[error("BigQuery error: {0}")]
    BigQuery(#[from] gcp_bigquery_client::error::BQError),

    /// Object storage error from the bucket progress store.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// PostgreSQL error from the progress store backend.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding progress records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from progress files or socket setup.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for errors that retrying the same cycle cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigLoad(_)
                | Error::MissingSetting { .. }
                | Error::UnknownKeyColumn { .. }
        )
    }
}

/// A convenient Result type alias for replication operations.
///
/// This is equivalent to `std::result::Result<T, mssql_cdc_sync::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
