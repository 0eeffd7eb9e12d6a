//! Content-hash baseline and the integrity gate consulted on modification.

mod baseline;
mod digest;
mod error;
mod gate;
mod schema;
mod store;

pub use baseline::{initialize, rebuild, BaselineReport};
pub use digest::{hash_file, hash_reader, path_key, DEFAULT_CHUNK_SIZE};
pub use error::{IntegrityError, StoreError};
pub use gate::{IntegrityGate, Verdict};
pub use schema::{SCHEMA, SCHEMA_VERSION};
pub use store::{
    default_database_path, open_baseline, BaselineStore, IntegrityRecord, SqliteBaseline,
};
