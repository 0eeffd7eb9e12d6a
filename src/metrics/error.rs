//! Host metrics error types.

use std::path::PathBuf;

/// Errors that can occur while sampling host counters.
#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    /// A counter file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A counter file did not have the expected layout.
    #[error("Malformed counters in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
