//! Multi-port TCP ingestion service for clinical-analyzer result messages.
//!
//! Bytes arrive over ASTM E1381/E1394 or HL7 v2.x/MLLP on one of several
//! configured ports, get mapped onto a canonical [`model::Message`], are
//! persisted durably, and are eventually forwarded to a remote system by the
//! outbound [`sync`] engine.

pub mod config;
pub mod connection;
pub mod decode;
pub mod error;
pub mod events;
pub mod listener;
pub mod mapper;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod sync;

pub use error::{Error, Result};
