//! KCP ARQ engine plus a peer/session layer for reliable delivery over UDP.
//!
//! This crate is split into two layers. [`kcp`] (re-exported as [`Kcp`]) is
//! the wire-compatible ARQ engine from the [KCP protocol][kcp]: sliding
//! windows, selective ACK, fast retransmit and RTO estimation, operating
//! purely on bytes with no socket of its own. [`peer`] and [`server`] build
//! a session layer on top: handshake, anti-spoof cookies, keepalive pings,
//! and choke/timeout detection, multiplexed over one UDP socket by
//! [`Server`].
//!
//! [kcp]: https://github.com/skywind3000/kcp

extern crate bytes;
#[macro_use]
extern crate log;

mod channel;
mod config;
mod error;
mod kcp;
mod peer;
mod segment;
mod server;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use super::{
        Channel, ConnectionId, DisconnectReason, Kcp, KcpConfig, Peer, PeerEvent, Role, Server,
        ServerEvent,
    };
}

pub use channel::{Channel, Opcode};
pub use config::KcpConfig;
pub use error::Error;
pub use kcp::Kcp;
pub use peer::{DisconnectReason, Peer, PeerEvent, PeerState, Role};
pub use server::{ConnectionId, Server, ServerEvent};

/// Crate-wide result alias.
pub type KcpResult<T> = Result<T, Error>;
