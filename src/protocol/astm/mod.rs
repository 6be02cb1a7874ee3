//! ASTM E1381 framing and E1394 record structure.

pub mod codec;
pub mod constants;
pub mod decode;

use constants::{CR, ETB, ETX, FIELD_DELIMITER, STX};

use crate::protocol::error::{ProtocolError, Result};

/// A single `|`-delimited ASTM record. `fields[0]` is the record-type letter
/// (`H`, `P`, `O`, `R`, `C`, `Q`, `L`), matching the wire layout where the type
/// letter occupies the first field position.
#[derive(Debug, Clone)]
pub struct Record {
    pub fields: Vec<String>,
}

impl Record {
    pub fn parse(data: &str) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::InvalidRecordFormat("empty record".into()));
        }
        let fields = data
            .split(FIELD_DELIMITER as char)
            .map(|s| s.to_string())
            .collect();
        Ok(Self { fields })
    }

    pub fn record_type(&self) -> &str {
        self.fields.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(|s| s.as_str()).unwrap_or("")
    }

    /// Split a component-delimited field (e.g. `^^^GLU`) into its parts.
    pub fn components(field: &str) -> Vec<&str> {
        field.split(constants::COMPONENT_DELIMITER as char).collect()
    }
}

/// A data-link frame: `STX <seq> <content> <ETX|ETB> <checksum> CR LF`.
/// `is_last` distinguishes a terminating `ETX` frame from an `ETB`
/// continuation frame whose payload is concatenated with the next.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u8,
    pub content: Vec<u8>,
    pub is_last: bool,
}

impl Frame {
    pub fn new(sequence: u8, content: Vec<u8>, is_last: bool) -> Self {
        Self {
            sequence,
            content,
            is_last,
        }
    }

    /// Encode to the exact bytes a peer expects on the wire, including the
    /// mod-256 checksum rendered as two uppercase hex digits.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.content.len() + 8);
        buf.push(STX);
        buf.push(self.sequence + b'0');
        buf.extend_from_slice(&self.content);
        buf.push(if self.is_last { ETX } else { ETB });
        let checksum = Self::checksum(&buf[1..]);
        buf.extend_from_slice(format!("{checksum:02X}").as_bytes());
        buf.push(CR);
        buf.push(constants::LF);
        buf
    }

    /// Parse one complete frame (STX already present at `data[0]`). Returns
    /// the number of bytes consumed alongside the frame, since the caller may
    /// have more buffered bytes after it.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() || data[0] != STX {
            return Err(ProtocolError::InvalidFrameFormat(
                "frame does not start with STX".into(),
            ));
        }
        let end_pos = data
            .iter()
            .position(|&b| b == ETX || b == ETB)
            .ok_or_else(|| ProtocolError::InvalidFrameFormat("missing ETX/ETB".into()))?;
        if data.len() < end_pos + 5 {
            return Err(ProtocolError::InvalidFrameFormat(
                "frame truncated before checksum/CRLF".into(),
            ));
        }
        let is_last = data[end_pos] == ETX;
        let sequence = data[1]
            .checked_sub(b'0')
            .ok_or_else(|| ProtocolError::InvalidFrameFormat("invalid sequence digit".into()))?;
        let content = data[2..end_pos].to_vec();

        let expected = Self::parse_hex(&data[end_pos + 1..end_pos + 3])?;
        let actual = Self::checksum(&data[1..=end_pos]);
        let consumed = end_pos + 5; // ETX/ETB + 2 hex digits + CR + LF

        if expected != actual {
            return Err(ProtocolError::InvalidChecksum {
                expected: format!("{expected:02X}"),
                actual: format!("{actual:02X}"),
            });
        }

        Ok((
            Self {
                sequence,
                content,
                is_last,
            },
            consumed,
        ))
    }

    fn checksum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        (sum % 256) as u8
    }

    fn parse_hex(bytes: &[u8]) -> Result<u8> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::InvalidFrameFormat("checksum is not ASCII".into()))?;
        u8::from_str_radix(s, 16)
            .map_err(|_| ProtocolError::InvalidFrameFormat("checksum is not hex".into()))
    }
}

/// Split a fully reassembled frame payload into `|`-delimited records.
pub fn split_payload_to_records(payload: &[u8]) -> Result<Vec<Record>> {
    let text = String::from_utf8_lossy(payload);
    text.split(CR as char)
        .filter(|s| !s.is_empty())
        .map(Record::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = Frame::new(1, b"H|\\^&|||".to_vec(), true);
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::parse(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.content, frame.content);
        assert!(decoded.is_last);
    }

    #[test]
    fn frame_rejects_bad_checksum() {
        let frame = Frame::new(2, b"P|1|322288".to_vec(), true);
        let mut encoded = frame.encode();
        // corrupt one checksum hex digit
        let len = encoded.len();
        encoded[len - 4] = b'0';
        encoded[len - 3] = b'0';
        let err = Frame::parse(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChecksum { .. }));
    }

    #[test]
    fn record_splits_fields() {
        let record = Record::parse("R|1|^^^GLU|5.3|mmol/L").unwrap();
        assert_eq!(record.record_type(), "R");
        assert_eq!(record.field(2), "^^^GLU");
        assert_eq!(Record::components(record.field(2)), vec!["", "", "", "GLU"]);
    }
}
