//! Database schema for the baseline store.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the baseline database.
pub const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;

-- One row per known file, keyed by a digest of its path
CREATE TABLE IF NOT EXISTS baseline (
    path_key TEXT PRIMARY KEY NOT NULL,
    path BLOB NOT NULL,
    hash TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Schema version table for migrations
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_baseline_updated_at ON baseline(updated_at);
";
