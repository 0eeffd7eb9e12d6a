//! Full-scan baseline construction.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use walkdir::WalkDir;

use super::digest::hash_file;
use super::error::IntegrityError;
use super::store::BaselineStore;

const BATCH_SIZE: usize = 512;

/// Counts from a baseline scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BaselineReport {
    /// Regular files hashed and recorded.
    pub hashed: usize,
    /// Entries that could not be read.
    pub skipped: usize,
}

/// Hash every regular file below `roots` into `store`.
///
/// Symlinks are not followed and non-regular files are never opened.
/// Unreadable entries are counted as skipped.
///
/// # Errors
///
/// Returns [`IntegrityError::Store`] if writing to the store fails.
pub fn initialize(
    store: &dyn BaselineStore,
    roots: &[PathBuf],
    chunk_size: usize,
) -> Result<BaselineReport, IntegrityError> {
    let mut report = BaselineReport::default();
    let mut batch: Vec<(PathBuf, String)> = Vec::with_capacity(BATCH_SIZE);
    let started = Utc::now();

    for root in roots {
        tracing::info!(root = %root.display(), "Building baseline");
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    report.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match hash_file(entry.path(), chunk_size) {
                Ok(hash) => {
                    batch.push((entry.into_path(), hash));
                    report.hashed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to hash file");
                    report.skipped += 1;
                }
            }
            if batch.len() >= BATCH_SIZE {
                store.put_all(&batch, started)?;
                batch.clear();
            }
        }
    }
    if !batch.is_empty() {
        store.put_all(&batch, started)?;
    }

    tracing::info!(
        hashed = report.hashed,
        skipped = report.skipped,
        "Baseline built"
    );
    Ok(report)
}

/// Clear `store` and rebuild it from `roots`.
///
/// # Errors
///
/// Returns [`IntegrityError::Store`] if clearing or writing fails.
pub fn rebuild(
    store: &dyn BaselineStore,
    roots: &[PathBuf],
    chunk_size: usize,
) -> Result<BaselineReport, IntegrityError> {
    store.reset()?;
    initialize(store, roots, chunk_size)
}
