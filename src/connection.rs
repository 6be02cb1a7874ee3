//! Connection Handler: one task per accepted socket, owning the framing
//! codec, the record decoder, and the ack policy for its listener's
//! protocol. Back-pressure (reads suspended until the current Message is
//! durably stored, ACK withheld until persistence succeeds) falls out of
//! the natural sequencing of this read loop rather than a separate
//! mechanism.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::decode::Decoded;
use crate::events::{Event, EventBus};
use crate::mapper::FieldMap;
use crate::model::{Message, Protocol};
use crate::persistence::Store;
use crate::protocol::astm::codec::{AstmSessionCodec, CodecAction};
use crate::protocol::astm;
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::hl7::codec::{MllpAction, MllpCodec};
use crate::protocol::hl7::{self, constants as hl7_constants};

const READ_BUFFER_SIZE: usize = 8192;
const PERSIST_RETRY_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Connection-health classification: a connection that has gone quiet gets a
/// tighter read timeout, closing faster once truly idle instead of waiting
/// out the full budget every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Health {
    fn classify(consecutive_timeouts: u32) -> Self {
        match consecutive_timeouts {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Unhealthy,
        }
    }

    fn read_timeout(self, idle_timeout: Duration) -> Duration {
        match self {
            Health::Healthy => idle_timeout,
            Health::Degraded => idle_timeout / 2,
            Health::Unhealthy => idle_timeout / 4,
        }
    }
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    analyzer_instance: String,
    protocol: Protocol,
    field_map: FieldMap,
    idle_timeout: Duration,
    store: Arc<Store>,
    events: EventBus,
    realtime_wake: Option<mpsc::UnboundedSender<()>>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        port: u16,
        analyzer_instance: String,
        protocol: Protocol,
        field_map: FieldMap,
        idle_timeout: Duration,
        store: Arc<Store>,
        events: EventBus,
        realtime_wake: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            stream,
            peer,
            port,
            analyzer_instance,
            protocol,
            field_map,
            idle_timeout,
            store,
            events,
            realtime_wake,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        log::info!(
            "connection opened: port={} peer={} protocol={:?}",
            self.port,
            self.peer,
            self.protocol
        );
        let outcome = match self.protocol {
            Protocol::Astm => self.run_astm().await,
            Protocol::Hl7 => self.run_hl7().await,
            Protocol::Poct1a => Err(ProtocolError::UnsupportedProtocol(
                "POCT1-A XML decoding is out of scope".into(),
            )),
        };
        match &outcome {
            Ok(()) => log::info!("connection closed: port={} peer={}", self.port, self.peer),
            Err(e) => log::warn!(
                "connection closed: port={} peer={} reason={e}",
                self.port,
                self.peer
            ),
        }
        outcome
    }

    async fn run_astm(&mut self) -> Result<()> {
        let mut codec = AstmSessionCodec::new();
        let mut pending_records = Vec::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut consecutive_timeouts = 0u32;

        loop {
            let health = Health::classify(consecutive_timeouts);
            let read_timeout = health.read_timeout(self.idle_timeout);
            let n = match tokio::time::timeout(read_timeout, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => {
                    consecutive_timeouts = 0;
                    n
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= 3 || health == Health::Unhealthy {
                        return Err(ProtocolError::Timeout);
                    }
                    continue;
                }
            };

            let actions = codec.feed(&buffer[..n])?;
            for action in actions {
                match action {
                    CodecAction::Reply(bytes) => self.stream.write_all(&bytes).await?,
                    CodecAction::PayloadReady(payload) => {
                        match astm::split_payload_to_records(&payload) {
                            Ok(mut records) => pending_records.append(&mut records),
                            Err(e) => self.events.publish(Event::Warning {
                                kind: "astm_decode".into(),
                                detail: e.to_string(),
                            }),
                        }
                    }
                    CodecAction::SessionEnd => {
                        if !pending_records.is_empty() {
                            let records = std::mem::take(&mut pending_records);
                            self.finalize_astm_session(&records).await?;
                        }
                    }
                }
            }
        }
    }

    async fn finalize_astm_session(
        &mut self,
        records: &[astm::Record],
    ) -> Result<()> {
        use crate::protocol::astm::decode::decode_records;
        match decode_records(&self.analyzer_instance, records, &self.field_map) {
            Ok(decoded) => self.persist_decoded(decoded).await,
            Err(e) => {
                self.events.publish(Event::Warning {
                    kind: "invalid_record".into(),
                    detail: e.to_string(),
                });
                log::warn!("dropping ASTM message from {}: {e}", self.peer);
                Ok(())
            }
        }
    }

    async fn run_hl7(&mut self) -> Result<()> {
        let mut codec = MllpCodec::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut consecutive_errors = 0u32;
        let mut consecutive_timeouts = 0u32;

        loop {
            let health = Health::classify(consecutive_timeouts);
            let read_timeout = health.read_timeout(self.idle_timeout);
            let n = match tokio::time::timeout(read_timeout, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => {
                    consecutive_timeouts = 0;
                    n
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= 3 || health == Health::Unhealthy {
                        return Err(ProtocolError::Timeout);
                    }
                    continue;
                }
            };

            for action in codec.feed(&buffer[..n]) {
                match action {
                    MllpAction::DiscardedOutsideEnvelope(count) => {
                        self.events.publish(Event::Warning {
                            kind: "mllp_envelope".into(),
                            detail: format!("discarded {count} bytes outside MLLP envelope"),
                        });
                    }
                    MllpAction::MessageReady(bytes) => {
                        let ok = self.handle_hl7_message(&bytes).await?;
                        if !ok {
                            consecutive_errors += 1;
                            if consecutive_errors >= hl7_constants::MAX_CONSECUTIVE_ERRORS {
                                return Err(ProtocolError::FatalConnection(
                                    "too many consecutive HL7 parse failures".into(),
                                ));
                            }
                        } else {
                            consecutive_errors = 0;
                        }
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` on a successfully decoded-and-persisted message,
    /// `Ok(false)` on a recoverable parse/validation failure (an `AE`/`AR`
    /// was sent and the session continues).
    async fn handle_hl7_message(&mut self, raw: &[u8]) -> Result<bool> {
        let text = String::from_utf8_lossy(raw);
        let (segments, delimiters) = match hl7::split_message_to_segments(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let ack = hl7::build_ack("0", hl7_constants::ACK_CODE_ERROR);
                self.stream.write_all(&ack).await?;
                self.events.publish(Event::Warning {
                    kind: "hl7_decode".into(),
                    detail: e.to_string(),
                });
                return Ok(false);
            }
        };
        let control_id = hl7::control_id(&segments);

        use crate::protocol::hl7::decode::decode_segments;
        match decode_segments(&self.analyzer_instance, &segments, &delimiters, &self.field_map) {
            Ok(decoded) => {
                self.persist_decoded(decoded).await?;
                let ack = hl7::build_ack(&control_id, hl7_constants::ACK_CODE_ACCEPT);
                self.stream.write_all(&ack).await?;
                Ok(true)
            }
            Err(e) => {
                let ack = hl7::build_ack(&control_id, hl7_constants::ACK_CODE_REJECT);
                self.stream.write_all(&ack).await?;
                self.events.publish(Event::Warning {
                    kind: "invalid_record".into(),
                    detail: e.to_string(),
                });
                log::warn!("dropping HL7 message from {}: {e}", self.peer);
                Ok(false)
            }
        }
    }

    async fn persist_decoded(&mut self, decoded: Decoded) -> Result<()> {
        for warning in &decoded.warnings {
            self.events.publish(Event::Warning {
                kind: format!("mapping:{}", warning.record_type),
                detail: warning.detail.clone(),
            });
        }
        self.persist_message(decoded.message).await
    }

    /// Persistence errors refuse to ACK and retry up to 3 times with 200ms
    /// backoff before the connection is closed; the analyzer is trusted to
    /// retransmit on a fresh session.
    async fn persist_message(&mut self, message: Message) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.persist_message(&self.analyzer_instance, &message).await {
                Ok(persisted) => {
                    self.events.publish(Event::MessageIngested {
                        port: self.port,
                        summary: format!(
                            "{} result(s) for sample(s) in message from {}",
                            persisted.len(),
                            self.analyzer_instance
                        ),
                    });
                    if let Some(wake) = &self.realtime_wake {
                        for _ in &persisted {
                            let _ = wake.send(());
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= PERSIST_RETRY_ATTEMPTS {
                        self.events.publish(Event::Error {
                            kind: "persistence".into(),
                            detail: e.to_string(),
                        });
                        return Err(ProtocolError::FatalConnection(format!(
                            "persistence failed after {attempt} attempts: {e}"
                        )));
                    }
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
            }
        }
    }
}
