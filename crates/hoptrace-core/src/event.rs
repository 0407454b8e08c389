//! Events flowing into the engine task.

use crate::TraceError;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Something the ping transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport resolved the target and is ready to send.
    Started { address: IpAddr },
    /// Resolution or socket setup failed.
    StartFailed { error: std::io::Error },
    /// An echo request left the socket.
    Sent { sequence: u16, sent_at: Instant },
    /// An echo request could not be sent.
    SendFailed { sequence: u16, error: std::io::Error },
    /// An ICMP message from a router other than the destination.
    ///
    /// `quoted_sequence` is the echo sequence number found in the quoted
    /// datagram, when the transport was able to extract it.
    IntermediateReply {
        source: IpAddr,
        quoted_sequence: Option<u16>,
        received_at: Instant,
    },
    /// An echo reply matching an outstanding request.
    MatchedReply { sequence: u16, received_at: Instant },
}

/// Input of the engine task's event loop, besides commands.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Transport { run: u64, event: TransportEvent },
    Timeout { generation: u64 },
}

/// Handle given to a transport at start, used to report what it observes.
///
/// Every handle is bound to one run; events reported after that run ended are
/// dropped by the engine.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    run: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransportEvents {
    pub(crate) fn new(run: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { run, tx }
    }

    /// Reports a raw event.
    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send(EngineEvent::Transport { run: self.run, event }).is_err() {
            trace!(run = self.run, "Engine gone, dropping transport event");
        }
    }

    pub fn started(&self, address: IpAddr) {
        self.emit(TransportEvent::Started { address });
    }

    pub fn start_failed(&self, error: std::io::Error) {
        self.emit(TransportEvent::StartFailed { error });
    }

    /// Reports a sent probe, stamped with the current time.
    pub fn sent(&self, sequence: u16) {
        self.emit(TransportEvent::Sent {
            sequence,
            sent_at: Instant::now(),
        });
    }

    pub fn send_failed(&self, sequence: u16, error: std::io::Error) {
        self.emit(TransportEvent::SendFailed { sequence, error });
    }

    /// Reports an intermediate-hop reply, stamped with the current time.
    pub fn intermediate_reply(&self, source: IpAddr, quoted_sequence: Option<u16>) {
        self.emit(TransportEvent::IntermediateReply {
            source,
            quoted_sequence,
            received_at: Instant::now(),
        });
    }

    /// Reports a destination reply, stamped with the current time.
    pub fn matched_reply(&self, sequence: u16) {
        self.emit(TransportEvent::MatchedReply {
            sequence,
            received_at: Instant::now(),
        });
    }

    /// Whether the engine task is still listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl TransportEvent {
    /// Error carried by a failure event, converted for observers.
    pub(crate) fn into_error(self, host: &str) -> Option<TraceError> {
        match self {
            TransportEvent::StartFailed { error } => Some(TraceError::TransportStart {
                host: host.to_string(),
                source: error,
            }),
            TransportEvent::SendFailed { sequence, error } => Some(TraceError::ProbeSend {
                sequence: Some(sequence),
                source: error,
            }),
            _ => None,
        }
    }
}
