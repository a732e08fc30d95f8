//! Storage subsystem
//!
//! This module provides the backend abstraction the session lock protocol runs
//! against, and three implementations of it.
//!
//! Components:
//! - `storage_trait`: the `SessionBackend` trait defining the keyed record contract.
//! - `types`: `SessionRecord`, `SessionKey` and the update payloads shared by backends.
//! - `memory_storage`: process-local map, used by tests and single-process setups.
//! - `file_storage`: filesystem-backed implementation for simple persistence and inspection.
//! - `database_storage`: ORM-based SQLite implementation using SeaORM.
//! - `db_entities`: SeaORM entity model for the database backend.

pub mod database_storage;
pub mod db_entities;
pub mod file_storage;
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

pub use database_storage::DatabaseStorage;
pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;
pub use storage_trait::SessionBackend;
pub use types::{ActionFlags, SessionKey, SessionRecord};

use std::sync::Arc;

use crate::configuration::{BackendConfig, BackendKind};
use crate::error_handling::types::StorageError;

/// Opens the backend described by the configuration.
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn SessionBackend>, StorageError> {
    let backend: Arc<dyn SessionBackend> = match (config.kind, &config.path) {
        (BackendKind::Memory, _) => Arc::new(MemoryStorage::new()),
        (BackendKind::File, Some(path)) => Arc::new(FileStorage::new(path)?),
        (BackendKind::File, None) => Arc::new(FileStorage::new_default()?),
        (BackendKind::Sqlite, Some(path)) => Arc::new(DatabaseStorage::new_file(path)?),
        (BackendKind::Sqlite, None) => Arc::new(DatabaseStorage::new()?),
    };
    Ok(backend)
}
