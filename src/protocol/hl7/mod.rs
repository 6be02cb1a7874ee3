//! HL7 v2.x segment structure carried inside an MLLP envelope.

pub mod codec;
pub mod constants;
pub mod decode;

use crate::protocol::error::{ProtocolError, Result};

/// A single `|`-delimited HL7 segment. `fields[0]` is the 3-letter segment
/// type (`MSH`, `PID`, `OBR`, `OBX`, `NTE`, `QRD`), matching the HL7 wire
/// layout where the segment type occupies field position zero.
#[derive(Debug, Clone)]
pub struct Segment {
    pub fields: Vec<String>,
}

impl Segment {
    pub fn parse(line: &str, field_sep: char) -> Result<Self> {
        if line.is_empty() {
            return Err(ProtocolError::InvalidRecordFormat("empty segment".into()));
        }
        let fields = line.split(field_sep).map(|s| s.to_string()).collect();
        Ok(Self { fields })
    }

    pub fn segment_type(&self) -> &str {
        self.fields.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(|s| s.as_str()).unwrap_or("")
    }

    /// Split a component-delimited field (e.g. `GLU^Glucose^LOCAL`) into its parts.
    pub fn components(field: &str, component_sep: char) -> Vec<&str> {
        field.split(component_sep).collect()
    }
}

/// MSH-1 is the field separator itself; MSH-2 carries the remaining encoding
/// characters in the fixed order component/repetition/escape/subcomponent.
#[derive(Debug, Clone, Copy)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: constants::DEFAULT_FIELD_SEPARATOR,
            component: constants::DEFAULT_COMPONENT_SEPARATOR,
            repetition: constants::DEFAULT_REPETITION_SEPARATOR,
            escape: constants::DEFAULT_ESCAPE_CHARACTER,
            subcomponent: constants::DEFAULT_SUBCOMPONENT_SEPARATOR,
        }
    }
}

impl Delimiters {
    /// Read from the raw MSH line (before it's been segment-split, since the
    /// field separator must be known before we can split it).
    pub fn from_msh_line(line: &str) -> Self {
        let bytes = line.as_bytes();
        if bytes.len() < 9 || &bytes[0..3] != b"MSH" {
            return Self::default();
        }
        let field = bytes[3] as char;
        let encoding = &line[4..];
        let encoding_chars: Vec<char> = encoding.chars().take(4).collect();
        Self {
            field,
            component: *encoding_chars.first().unwrap_or(&constants::DEFAULT_COMPONENT_SEPARATOR),
            repetition: *encoding_chars.get(1).unwrap_or(&constants::DEFAULT_REPETITION_SEPARATOR),
            escape: *encoding_chars.get(2).unwrap_or(&constants::DEFAULT_ESCAPE_CHARACTER),
            subcomponent: *encoding_chars
                .get(3)
                .unwrap_or(&constants::DEFAULT_SUBCOMPONENT_SEPARATOR),
        }
    }
}

/// Split a de-enveloped HL7 message into `|`-delimited segments, reading the
/// field delimiter from the `MSH` line itself.
pub fn split_message_to_segments(message: &str) -> Result<(Vec<Segment>, Delimiters)> {
    let msh_line = message
        .split(constants::CR as char)
        .find(|line| line.starts_with(constants::HEADER_SEGMENT))
        .ok_or_else(|| ProtocolError::InvalidRecordFormat("no MSH segment present".into()))?;
    let delimiters = Delimiters::from_msh_line(msh_line);

    let segments = message
        .split(constants::CR as char)
        .filter(|s| !s.is_empty())
        .map(|s| Segment::parse(s, delimiters.field))
        .collect::<Result<Vec<_>>>()?;
    Ok((segments, delimiters))
}

/// The `MSH-10` message control ID, echoed back in the `MSA-2` field of the
/// acknowledgement. Returns `"0"` when absent, since an ACK must still be
/// sent even for a malformed header.
pub fn control_id(segments: &[Segment]) -> String {
    segments
        .iter()
        .find(|s| s.segment_type() == constants::HEADER_SEGMENT)
        .map(|msh| msh.field(constants::MSH_CONTROL_ID_FIELD).to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "0".to_string())
}

/// Builds an `ACK`/`AE`/`AR` response message wrapped in an MLLP envelope:
/// `MSH|...|ACK^...|...\rMSA|<code>|<control_id>\r`.
pub fn build_ack(control_id: &str, code: &str) -> Vec<u8> {
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let body = format!(
        "MSH|^~\\&|LIS|LIS||||{timestamp}||ACK|{control_id}|P|2.4\rMSA|{code}|{control_id}\r"
    );
    let mut envelope = vec![constants::VT];
    envelope.extend_from_slice(body.as_bytes());
    envelope.push(constants::FS);
    envelope.push(constants::CR);
    envelope
}

#[cfg(test)]
mod ack_tests {
    use super::*;

    #[test]
    fn control_id_reads_msh_10() {
        let (segments, _) = split_message_to_segments(
            "MSH|^~\\&|BS430|LAB|LIS|RECV|20260101120000||ORU^R01|123456|P|2.4",
        )
        .unwrap();
        assert_eq!(control_id(&segments), "123456");
    }

    #[test]
    fn build_ack_wraps_msa_in_mllp_envelope() {
        let ack = build_ack("123456", constants::ACK_CODE_ACCEPT);
        assert_eq!(ack[0], constants::VT);
        assert_eq!(*ack.last().unwrap(), constants::CR);
        let body = String::from_utf8(ack[1..ack.len() - 2].to_vec()).unwrap();
        assert!(body.contains("MSA|AA|123456"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_delimiters_from_msh() {
        let msh = "MSH|^~\\&|LAB|HOSPITAL|LIS|RECEIVER|20260101120000||ORU^R01|123456|P|2.4";
        let delim = Delimiters::from_msh_line(msh);
        assert_eq!(delim.field, '|');
        assert_eq!(delim.component, '^');
        assert_eq!(delim.repetition, '~');
        assert_eq!(delim.escape, '\\');
        assert_eq!(delim.subcomponent, '&');
    }

    #[test]
    fn splits_segments_on_cr() {
        let message = "MSH|^~\\&|LAB|HOSPITAL\rPID|1|322288\rOBX|1|NM|GLU||5.3|mmol/L";
        let (segments, _) = split_message_to_segments(message).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].segment_type(), "PID");
    }
}
