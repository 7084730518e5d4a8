//! IDL error types.
//!
//! One enum covers bootstrap, lookup, transaction and configuration failures.
//! The classification helpers at the bottom are what the retry policies and
//! the transaction wrapper match on.

use std::time::Duration;

use thiserror::Error;

pub type IdlResult<T> = Result<T, IdlError>;

#[derive(Debug, Error)]
pub enum IdlError {
    #[error(
        "OVS database connection to {schema} failed with error: '{error}'. Verify that the \
         OVS and OVN services are available and that the connection options are correct."
    )]
    ConnectionUnavailable { schema: String, error: String },

    #[error("{value} does not exist in {column} of {table}")]
    RowNotFound {
        table: String,
        column: String,
        value: String,
    },

    #[error("Cannot find {table} with {record}")]
    RecordNotFound { table: String, record: String },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Revision conflict: {0}")]
    RevisionConflict(String),

    #[error("Transaction rejected: {0}")]
    Transaction(String),

    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl IdlError {
    /// The row looked up by value is not (yet) present in the mirror.
    pub fn is_row_not_found(&self) -> bool {
        matches!(self, IdlError::RowNotFound { .. })
    }

    /// The server could not be reached; bootstrap keeps retrying these.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, IdlError::ConnectionUnavailable { .. })
    }

    pub fn is_revision_conflict(&self) -> bool {
        matches!(self, IdlError::RevisionConflict(_))
    }
}
