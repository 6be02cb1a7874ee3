//! Persistence layer: a local SQLite store (`sqlx` + `SqlitePool`) with three
//! tables (`patients`, `orders`, `results`), keyed for idempotent upsert and
//! carrying the `sync_status`/`created_at` bookkeeping the Sync Engine
//! depends on.

mod schema;
mod store;

pub use store::{PersistedResult, Store, SyncRow};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("patient record has neither external nor internal id")]
    MissingPatientIdentity,
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
