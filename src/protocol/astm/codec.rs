//! ASTM E1381 session state machine: the `Idle`/`AwaitFrame` handshake that
//! turns a raw byte stream into framed payloads and drives the ACK/NAK
//! responses a peer expects. Record splitting itself stays in
//! [`super::split_payload_to_records`]; this module only owns handshake and
//! frame validation.

use crate::protocol::astm::constants::{EOT, ETB, MAX_CONSECUTIVE_NAKS, NAK, STX};
use crate::protocol::astm::constants::{ACK, ENQ};
use crate::protocol::astm::Frame;
use crate::protocol::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitFrame,
}

/// What the caller should do in response to bytes just fed into the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecAction {
    /// Write these bytes back to the peer (a single ACK or NAK byte).
    Reply(Vec<u8>),
    /// A fully reassembled (ETB-concatenated) frame payload, ready to split
    /// into records.
    PayloadReady(Vec<u8>),
    /// `EOT` observed: the session is over, flush any in-flight `Message`.
    SessionEnd,
}

/// Drives one ASTM session's handshake and frame reassembly. A fresh codec is
/// created per [`crate::connection::Connection`]; sequence numbers reset to 1
/// on every `ENQ`, so a reconnecting instrument always starts a clean
/// handshake regardless of where the previous session left off.
pub struct AstmSessionCodec {
    state: SessionState,
    expected_seq: u8,
    consecutive_naks: u32,
    rx_buffer: Vec<u8>,
    pending_payload: Vec<u8>,
}

impl Default for AstmSessionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AstmSessionCodec {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            expected_seq: 1,
            consecutive_naks: 0,
            rx_buffer: Vec::new(),
            pending_payload: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feed newly read bytes; returns the ordered actions the caller must
    /// take (writes, then payload handoffs, in wire order).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<CodecAction>> {
        self.rx_buffer.extend_from_slice(bytes);
        let mut actions = Vec::new();

        loop {
            let Some(&head) = self.rx_buffer.first() else {
                break;
            };
            match self.state {
                SessionState::Idle => match head {
                    ENQ => {
                        self.rx_buffer.remove(0);
                        self.expected_seq = 1;
                        self.consecutive_naks = 0;
                        self.pending_payload.clear();
                        self.state = SessionState::AwaitFrame;
                        actions.push(CodecAction::Reply(vec![ACK]));
                    }
                    EOT => {
                        self.rx_buffer.remove(0);
                        actions.push(CodecAction::SessionEnd);
                    }
                    _ => {
                        // No handshake is in progress yet, so there is no sequence
                        // number or partial frame to protect: drop the byte and keep
                        // waiting for ENQ without replying. NAKing noise before a
                        // session even starts would just invite an instrument that
                        // hasn't sent ENQ yet to retransmit something we never asked for.
                        self.rx_buffer.remove(0);
                    }
                },
                SessionState::AwaitFrame => match head {
                    STX => match Frame::parse(&self.rx_buffer) {
                        Ok((frame, consumed)) => {
                            self.rx_buffer.drain(0..consumed);
                            if frame.sequence != self.expected_seq {
                                self.consecutive_naks += 1;
                                actions.push(CodecAction::Reply(vec![NAK]));
                                if self.consecutive_naks >= MAX_CONSECUTIVE_NAKS {
                                    return Err(ProtocolError::FatalConnection(
                                        "too many consecutive NAKs on the same sequence".into(),
                                    ));
                                }
                                continue;
                            }
                            self.consecutive_naks = 0;
                            self.expected_seq = (self.expected_seq + 1) % 8;
                            self.pending_payload.extend_from_slice(&frame.content);
                            actions.push(CodecAction::Reply(vec![ACK]));
                            if frame.is_last {
                                let payload = std::mem::take(&mut self.pending_payload);
                                actions.push(CodecAction::PayloadReady(payload));
                            }
                        }
                        Err(ProtocolError::InvalidChecksum { .. }) => {
                            self.consecutive_naks += 1;
                            actions.push(CodecAction::Reply(vec![NAK]));
                            self.resync();
                            if self.consecutive_naks >= MAX_CONSECUTIVE_NAKS {
                                return Err(ProtocolError::FatalConnection(
                                    "too many consecutive NAKs on the same sequence".into(),
                                ));
                            }
                        }
                        Err(ProtocolError::InvalidFrameFormat(_)) => {
                            // Frame not fully buffered yet; wait for more bytes.
                            break;
                        }
                        Err(e) => return Err(e),
                    },
                    EOT => {
                        self.rx_buffer.remove(0);
                        self.state = SessionState::Idle;
                        actions.push(CodecAction::SessionEnd);
                    }
                    ETB => {
                        // Stray continuation marker without a preceding STX: treat as
                        // an unexpected control byte.
                        self.rx_buffer.remove(0);
                        actions.push(CodecAction::Reply(vec![NAK]));
                    }
                    _ => {
                        actions.push(CodecAction::Reply(vec![NAK]));
                        self.resync();
                    }
                },
            }
        }

        Ok(actions)
    }

    /// Discard bytes up to (not including) the next `STX`/`EOT`, so a
    /// corrupted or unexpected byte mid-frame doesn't wedge the session: the
    /// next retransmit attempt by the peer can still be recognized.
    fn resync(&mut self) {
        match self
            .rx_buffer
            .iter()
            .skip(1)
            .position(|&b| b == STX || b == EOT)
        {
            Some(rel) => {
                self.rx_buffer.drain(0..=rel);
            }
            None => self.rx_buffer.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::astm::Frame;

    #[test]
    fn enq_gets_ack_and_enters_await_frame() {
        let mut codec = AstmSessionCodec::new();
        let actions = codec.feed(&[ENQ]).unwrap();
        assert_eq!(actions, vec![CodecAction::Reply(vec![ACK])]);
        assert_eq!(codec.state(), SessionState::AwaitFrame);
    }

    #[test]
    fn full_frame_is_acked_and_payload_surfaced() {
        let mut codec = AstmSessionCodec::new();
        codec.feed(&[ENQ]).unwrap();
        let frame = Frame::new(1, b"H|\\^&|||".to_vec(), true);
        let actions = codec.feed(&frame.encode()).unwrap();
        assert_eq!(
            actions,
            vec![
                CodecAction::Reply(vec![ACK]),
                CodecAction::PayloadReady(b"H|\\^&|||".to_vec())
            ]
        );
    }

    #[test]
    fn bad_checksum_is_nak_without_advancing_seq() {
        let mut codec = AstmSessionCodec::new();
        codec.feed(&[ENQ]).unwrap();
        let frame = Frame::new(1, b"P|1|322288".to_vec(), true);
        let mut bad = frame.encode();
        let len = bad.len();
        bad[len - 4] = b'0';
        bad[len - 3] = b'0';
        let actions = codec.feed(&bad).unwrap();
        assert_eq!(actions, vec![CodecAction::Reply(vec![NAK])]);

        // retransmit with correct checksum: should now ACK and surface payload
        let actions = codec.feed(&frame.encode()).unwrap();
        assert_eq!(
            actions,
            vec![
                CodecAction::Reply(vec![ACK]),
                CodecAction::PayloadReady(b"P|1|322288".to_vec())
            ]
        );
    }

    #[test]
    fn three_consecutive_naks_is_fatal() {
        let mut codec = AstmSessionCodec::new();
        codec.feed(&[ENQ]).unwrap();
        let frame = Frame::new(1, b"P|1|322288".to_vec(), true);
        let mut bad = frame.encode();
        let len = bad.len();
        bad[len - 4] = b'0';
        bad[len - 3] = b'0';
        codec.feed(&bad).unwrap();
        codec.feed(&bad).unwrap();
        let err = codec.feed(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::FatalConnection(_)));
    }

    #[test]
    fn eot_ends_session() {
        let mut codec = AstmSessionCodec::new();
        codec.feed(&[ENQ]).unwrap();
        let actions = codec.feed(&[EOT]).unwrap();
        assert_eq!(actions, vec![CodecAction::SessionEnd]);
        assert_eq!(codec.state(), SessionState::Idle);
    }

    #[test]
    fn etb_continuation_concatenates_before_surfacing() {
        let mut codec = AstmSessionCodec::new();
        codec.feed(&[ENQ]).unwrap();
        let first = Frame::new(1, b"R|1|^^^GLU|".to_vec(), false);
        let actions = codec.feed(&first.encode()).unwrap();
        assert_eq!(actions, vec![CodecAction::Reply(vec![ACK])]);

        let second = Frame::new(2, b"5.3|mmol/L".to_vec(), true);
        let actions = codec.feed(&second.encode()).unwrap();
        assert_eq!(
            actions,
            vec![
                CodecAction::Reply(vec![ACK]),
                CodecAction::PayloadReady(b"R|1|^^^GLU|5.3|mmol/L".to_vec())
            ]
        );
    }
}
