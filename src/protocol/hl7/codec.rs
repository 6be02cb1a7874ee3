//! MLLP envelope framing: `VT <message> FS CR`. No checksum; integrity
//! relies on TCP. Bytes observed outside an envelope are discarded with a
//! warning rather than treated as protocol-fatal.

use crate::protocol::hl7::constants::{CR, FS, VT};

/// Result of feeding bytes into the envelope scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MllpAction {
    /// A complete message was extracted from between `VT` and `FS CR`.
    MessageReady(Vec<u8>),
    /// Bytes were seen outside any envelope and discarded.
    DiscardedOutsideEnvelope(usize),
}

#[derive(Debug, Default)]
pub struct MllpCodec {
    rx_buffer: Vec<u8>,
}

impl MllpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes; returns zero or more actions in wire order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MllpAction> {
        self.rx_buffer.extend_from_slice(bytes);
        let mut actions = Vec::new();

        loop {
            let Some(start) = self.rx_buffer.iter().position(|&b| b == VT) else {
                if !self.rx_buffer.is_empty() {
                    actions.push(MllpAction::DiscardedOutsideEnvelope(self.rx_buffer.len()));
                    self.rx_buffer.clear();
                }
                break;
            };
            if start > 0 {
                actions.push(MllpAction::DiscardedOutsideEnvelope(start));
                self.rx_buffer.drain(0..start);
            }

            // rx_buffer[0] is now VT; look for FS CR after it.
            if self.rx_buffer.len() < 2 {
                break;
            }
            let Some(rel) = self.rx_buffer[1..].windows(2).position(|w| w == [FS, CR]) else {
                break; // envelope incomplete, wait for more bytes
            };
            let end = rel + 1; // absolute index of FS
            let message = self.rx_buffer[1..end].to_vec();
            self.rx_buffer.drain(0..end + 2);
            actions.push(MllpAction::MessageReady(message));
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_enveloped_message() {
        let mut codec = MllpCodec::new();
        let mut frame = vec![VT];
        frame.extend_from_slice(b"MSH|^~\\&|LAB");
        frame.push(FS);
        frame.push(CR);
        let actions = codec.feed(&frame);
        assert_eq!(
            actions,
            vec![MllpAction::MessageReady(b"MSH|^~\\&|LAB".to_vec())]
        );
    }

    #[test]
    fn discards_bytes_outside_envelope() {
        let mut codec = MllpCodec::new();
        let mut bytes = vec![b'x', b'y'];
        bytes.push(VT);
        bytes.extend_from_slice(b"MSH|1");
        bytes.push(FS);
        bytes.push(CR);
        let actions = codec.feed(&bytes);
        assert_eq!(
            actions,
            vec![
                MllpAction::DiscardedOutsideEnvelope(2),
                MllpAction::MessageReady(b"MSH|1".to_vec())
            ]
        );
    }

    #[test]
    fn waits_for_more_bytes_on_incomplete_envelope() {
        let mut codec = MllpCodec::new();
        let mut bytes = vec![VT];
        bytes.extend_from_slice(b"MSH|1");
        let actions = codec.feed(&bytes);
        assert!(actions.is_empty());

        let actions = codec.feed(&[FS, CR]);
        assert_eq!(
            actions,
            vec![MllpAction::MessageReady(b"MSH|1".to_vec())]
        );
    }
}
