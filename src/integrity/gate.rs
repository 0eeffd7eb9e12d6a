//! Content-hash check triggered by modification notifications.

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::digest::{hash_file, DEFAULT_CHUNK_SIZE};
use super::error::IntegrityError;
use super::store::BaselineStore;

/// Outcome of checking one file against the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Content matches the recorded hash.
    Unchanged,
    /// No hash was recorded; this one now is.
    FirstSeen { hash: String },
    /// Content differs from the recorded hash, which has been replaced.
    Mismatch { old_hash: String, new_hash: String },
    /// The file vanished before it could be hashed.
    FileGone,
}

/// Compares fresh content hashes with the baseline store.
#[derive(Clone)]
pub struct IntegrityGate {
    store: Arc<dyn BaselineStore>,
    chunk_size: usize,
}

impl IntegrityGate {
    /// Create a gate over `store`, hashing in `chunk_size` reads.
    #[must_use]
    pub fn new(store: Arc<dyn BaselineStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BaselineStore> {
        &self.store
    }

    /// Re-hash `path` and reconcile it with the baseline.
    ///
    /// # Errors
    ///
    /// - [`IntegrityError::NotRegularFile`] for directories, symlinks, FIFOs,
    ///   sockets and devices, which are never opened
    /// - [`IntegrityError::HashComputationFailed`] when reading fails for a
    ///   reason other than the file being gone
    /// - [`IntegrityError::Store`] when the baseline lookup or write fails
    pub fn on_modified(&self, path: &Path) -> Result<Verdict, IntegrityError> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Verdict::FileGone),
            Err(source) => {
                return Err(IntegrityError::HashComputationFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if !metadata.file_type().is_file() {
            return Err(IntegrityError::NotRegularFile(path.to_path_buf()));
        }

        let new_hash = match hash_file(path, self.chunk_size) {
            Ok(h) => h,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Verdict::FileGone),
            // Replaced by a symlink or special file since the type check.
            Err(e)
                if e.kind() == io::ErrorKind::InvalidInput
                    || e.raw_os_error() == Some(nix::libc::ELOOP) =>
            {
                return Err(IntegrityError::NotRegularFile(path.to_path_buf()))
            }
            Err(source) => {
                return Err(IntegrityError::HashComputationFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match self.store.get(path)? {
            None => {
                self.store.put(path, &new_hash, Utc::now())?;
                tracing::debug!(path = %path.display(), hash = %new_hash, "Recorded first hash");
                Ok(Verdict::FirstSeen { hash: new_hash })
            }
            Some(record) if record.hash == new_hash => Ok(Verdict::Unchanged),
            Some(record) => {
                self.store.put(path, &new_hash, Utc::now())?;
                Ok(Verdict::Mismatch {
                    old_hash: record.hash,
                    new_hash,
                })
            }
        }
    }
}
