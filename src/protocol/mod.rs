//! Wire protocol implementations: ASTM E1381/E1394 framing and record
//! decoding, and HL7 v2.x over MLLP. Both protocols project onto the same
//! [`crate::model::Message`] so the Connection Handler and Field Mapper stay
//! protocol-neutral above this module.

pub mod astm;
pub mod error;
pub mod hl7;

pub use error::{ProtocolError, Result};
