//! Shared result shape for both protocol decoders: a decoded
//! [`crate::model::Message`] plus the non-fatal mapping problems encountered
//! along the way. Kept protocol-neutral so the Connection Handler doesn't
//! need to know which wire protocol produced it.

use crate::model::Message;

/// A single non-fatal field extraction problem. The caller logs these and
/// keeps processing rather than aborting the whole message: the affected
/// record is dropped, a `MappingWarning` is surfaced, and decoding of the
/// remaining Message continues.
#[derive(Debug, Clone)]
pub struct MappingWarning {
    pub record_type: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct Decoded {
    pub message: Message,
    pub warnings: Vec<MappingWarning>,
}
