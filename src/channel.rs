//! Outer datagram framing: channel and opcode bytes sit in front of the
//! KCP segment header (or, for the unreliable channel, in front of the
//! raw payload).

use crate::error::Error;

/// Delivery channel, the first byte of every datagram on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Routed through the KCP engine: ordered, retransmitted, no size cap
    /// beyond the receive window's fragment budget.
    Reliable = 1,
    /// Sent as a single raw UDP datagram: no ordering, no retransmission,
    /// capped at one MTU.
    Unreliable = 2,
}

impl Channel {
    pub(crate) fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            1 => Ok(Channel::Reliable),
            2 => Ok(Channel::Unreliable),
            other => Err(Error::InvalidChannel(other)),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Opcode carried as the first byte of a reliable channel's decoded
/// message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Client-to-server handshake request; server-to-client handshake ack.
    Hello = 0,
    /// Keepalive, sent periodically by both ends once authenticated.
    Ping = 1,
    /// Application payload.
    Data = 2,
    /// Graceful close notification.
    Disconnect = 3,
}

impl Opcode {
    pub(crate) fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(Opcode::Hello),
            1 => Ok(Opcode::Ping),
            2 => Ok(Opcode::Data),
            3 => Ok(Opcode::Disconnect),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }
}
