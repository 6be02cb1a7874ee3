//! Outbound Sync Engine: drains `local` records to a remote endpoint on a
//! configurable cadence with at-least-once delivery, retry with exponential
//! backoff and jitter, and poisoning of non-retryable rows.

pub mod auth;
pub mod engine;

pub use engine::{backoff_for_attempt, SyncEngine};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
