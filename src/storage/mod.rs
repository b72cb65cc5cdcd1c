//! Storage module for database and configuration.

pub mod config;
pub mod database;
pub mod schema;

pub use config::{AppConfig, ConfigError, Settings};
pub use database::{Database, DatabaseError};

use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the database: the scheduler, ingestion and the worker
/// all serialize on this lock.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Wrap a database in a shared handle.
pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Lock the shared database, mapping a poisoned lock to a database error.
pub fn lock(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>, DatabaseError> {
    db.lock()
        .map_err(|_| DatabaseError::ConnectionFailed("database lock poisoned".to_string()))
}
