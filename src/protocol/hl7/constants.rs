//! MLLP envelope bytes and default HL7 v2.x delimiters.

pub const VT: u8 = 0x0B;
pub const FS: u8 = 0x1C;
pub const CR: u8 = 0x0D;

pub const DEFAULT_FIELD_SEPARATOR: char = '|';
pub const DEFAULT_COMPONENT_SEPARATOR: char = '^';
pub const DEFAULT_REPETITION_SEPARATOR: char = '~';
pub const DEFAULT_ESCAPE_CHARACTER: char = '\\';
pub const DEFAULT_SUBCOMPONENT_SEPARATOR: char = '&';

pub const HEADER_SEGMENT: &str = "MSH";
pub const PATIENT_SEGMENT: &str = "PID";
pub const ORDER_SEGMENT: &str = "OBR";
pub const RESULT_SEGMENT: &str = "OBX";
pub const COMMENT_SEGMENT: &str = "NTE";
pub const QUERY_SEGMENT: &str = "QRD";
pub const ACK_SEGMENT: &str = "MSA";

/// `MSH` carries its own field separator as MSH-1, which disappears when the
/// segment is split on it — every subsequent field index is shifted down by
/// one relative to its usual HL7 field number. `field(9)` is therefore
/// MSH-10, the message control ID this connection must echo back in `MSA-2`.
pub const MSH_CONTROL_ID_FIELD: usize = 9;

pub const ACK_CODE_ACCEPT: &str = "AA";
pub const ACK_CODE_ERROR: &str = "AE";
pub const ACK_CODE_REJECT: &str = "AR";

/// Close the connection after this many consecutive parse failures on the
/// same connection. MLLP carries no sequence numbers to key a "same frame"
/// retry on, so this plays the same role the NAK budget does for ASTM.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;
