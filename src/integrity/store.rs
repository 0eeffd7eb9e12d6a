//! Baseline hash store.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::digest::path_key;
use super::error::{IntegrityError, StoreError};
use super::schema::{SCHEMA, SCHEMA_VERSION};

/// Returns the default path for the baseline database.
///
/// This is `~/.local/share/irondome/integrity.db` on Unix systems.
#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("irondome")
        .join("integrity.db")
}

/// Open the baseline the monitor checks files against.
///
/// # Errors
///
/// Returns [`IntegrityError::StoreUnavailable`] if the database cannot be
/// opened or initialized.
pub fn open_baseline(path: &Path) -> Result<SqliteBaseline, IntegrityError> {
    SqliteBaseline::open(path).map_err(IntegrityError::StoreUnavailable)
}

/// Last known content hash of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityRecord {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Key/value contract the integrity gate consumes.
pub trait BaselineStore: Send + Sync {
    /// Record for `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn get(&self, path: &Path) -> Result<Option<IntegrityRecord>, StoreError>;

    /// Insert or replace the hash for `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, path: &Path, hash: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Store many hashes at once.
    ///
    /// # Errors
    ///
    /// Returns the first write error.
    fn put_all(&self, entries: &[(PathBuf, String)], at: DateTime<Utc>) -> Result<(), StoreError> {
        for (path, hash) in entries {
            self.put(path, hash, at)?;
        }
        Ok(())
    }

    /// Number of recorded files; zero means the baseline was never built.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn count(&self) -> Result<u64, StoreError>;

    /// Forget every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn reset(&self) -> Result<(), StoreError>;
}

/// `SQLite`-backed [`BaselineStore`].
#[derive(Debug)]
pub struct SqliteBaseline {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBaseline {
    /// Open the baseline database at `path`.
    ///
    /// Creates parent directories if they don't exist and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, the schema cannot be
    /// applied, or the file was written by a newer schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(|source| StoreError::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "Opened baseline store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory baseline for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    let found: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    match found {
        Some(found) if found > SCHEMA_VERSION => Err(StoreError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            Ok(())
        }
    }
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const UPSERT: &str = "INSERT INTO baseline (path_key, path, hash, first_seen, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?4)
     ON CONFLICT(path_key) DO UPDATE SET
         path = excluded.path,
         hash = excluded.hash,
         updated_at = excluded.updated_at";

impl BaselineStore for SqliteBaseline {
    fn get(&self, path: &Path) -> Result<Option<IntegrityRecord>, StoreError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT path, hash, first_seen, updated_at FROM baseline WHERE path_key = ?1",
                params![path_key(path)],
                |row| {
                    let raw: Vec<u8> = row.get(0)?;
                    Ok(IntegrityRecord {
                        path: PathBuf::from(OsString::from_vec(raw)),
                        hash: row.get(1)?,
                        first_seen: parse_timestamp(row, 2)?,
                        updated_at: parse_timestamp(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, path: &Path, hash: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            UPSERT,
            params![
                path_key(path),
                path.as_os_str().as_bytes(),
                hash,
                at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn put_all(&self, entries: &[(PathBuf, String)], at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            let at = at.to_rfc3339();
            for (path, hash) in entries {
                stmt.execute(params![
                    path_key(path),
                    path.as_os_str().as_bytes(),
                    hash,
                    at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM baseline", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn reset(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        let removed = conn.execute("DELETE FROM baseline", [])?;
        tracing::info!(removed, "Baseline reset");
        Ok(())
    }
}
