//! Integrity checking error types.

use std::path::PathBuf;

/// Errors raised by the baseline hash store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Failed to open or create database.
    #[error("Failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Failed to execute SQL.
    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Failed to create parent directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The database was written by a newer schema.
    #[error("Unsupported schema version {found}, expected at most {supported}")]
    SchemaVersion { found: u32, supported: u32 },
}

/// Errors raised while checking a file against the baseline.
#[derive(thiserror::Error, Debug)]
pub enum IntegrityError {
    /// Reading the file failed for a reason other than it being gone.
    #[error("Failed to hash {path}: {source}")]
    HashComputationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The path is not a regular file and is never opened.
    #[error("Not a regular file: {0}")]
    NotRegularFile(PathBuf),

    /// The baseline store could not be opened or initialized.
    #[error("Baseline store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
