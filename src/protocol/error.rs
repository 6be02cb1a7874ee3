use std::io;
use thiserror::Error;

/// Errors raised by the framing codecs and the record decoder.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("connection idle timeout")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid checksum: expected {expected}, got {actual}")]
    InvalidChecksum { expected: String, actual: String },

    #[error("invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("invalid record format: {0}")]
    InvalidRecordFormat(String),

    #[error("unexpected control byte: {0:#04x}")]
    UnexpectedControl(u8),

    #[error("malformed MLLP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("required identifier missing: {0}")]
    InvalidRecord(String),

    #[error("negative acknowledgment received")]
    NakReceived,

    #[error("fatal connection error: {0}")]
    FatalConnection(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
