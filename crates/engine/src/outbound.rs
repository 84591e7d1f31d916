//! Outbound message queue.

use lockstep_wire::{MessageKind, SignedPacket};

/// A signed packet queued for broadcast.
///
/// The engine performs no I/O; the transport drains the outbox and delivers
/// the encoded bytes to every peer. Every protocol message is a broadcast,
/// so there is no addressing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub packet: SignedPacket,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, packet: SignedPacket) -> Self {
        OutboundMessage { kind, packet }
    }

    /// Wire bytes for the transport.
    pub fn encode(&self) -> Vec<u8> {
        self.packet.encode()
    }

    /// Human-readable message kind for telemetry.
    pub fn type_name(&self) -> &'static str {
        self.kind.name()
    }
}
