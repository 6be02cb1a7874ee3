//! Crate-level error seam. Internal layers keep their own specific error type
//! (`protocol::ProtocolError`, `ConfigError`, `PersistenceError`,
//! `SyncError`) and only get folded into this `Error` at the outermost
//! boundaries — `main.rs` and the Connection Handler's top-level `run` —
//! rather than threading one god error type everywhere.

use thiserror::Error;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::protocol::ProtocolError;
use crate::sync::SyncError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
