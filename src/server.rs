//! Multiplexes many [`Peer`] sessions over one UDP socket, keyed by a
//! stable hash of each remote address. The socket itself is the
//! embedder's: this type only ever sees datagrams handed to it and a
//! callback through which to send.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::channel::Channel;
use crate::config::KcpConfig;
use crate::error::Error;
use crate::peer::{DisconnectReason, Peer, PeerEvent, Role};
use crate::segment;
use crate::KcpResult;

/// Opaque, stable handle for a remote endpoint, exposed to the embedder
/// for send/disconnect/lookup. Derived from the remote address by a
/// process-local hash, not meant to be portable across runs.
pub type ConnectionId = u64;

/// Something that happened to a connection during a server tick.
#[derive(Debug)]
pub enum ServerEvent {
    /// A provisional peer completed its handshake and was admitted.
    Connected(ConnectionId),
    /// A complete application message arrived from `connection_id`.
    Message {
        connection_id: ConnectionId,
        channel: Channel,
        payload: Vec<u8>,
    },
    /// `connection_id` reached `Disconnected` and was removed from the map.
    Disconnected(ConnectionId, DisconnectReason),
}

fn connection_id_for(addr: SocketAddr) -> ConnectionId {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish()
}

/// Multiplexes [`Peer`] sessions by remote address over one logical
/// socket. Datagrams come in through [`Server::handle_datagram`]; the
/// server drives its own clock and flushes through [`Server::tick_outgoing`].
pub struct Server {
    peers: HashMap<ConnectionId, Peer>,
    addrs: HashMap<ConnectionId, SocketAddr>,
    config: KcpConfig,
    send_to: Rc<RefCell<dyn FnMut(SocketAddr, &[u8]) -> io::Result<()>>>,
    on_error: Rc<RefCell<dyn FnMut(Error)>>,
}

impl Server {
    /// Build a server with the given session configuration. `send_to` is
    /// invoked with the destination address and raw bytes whenever any
    /// peer flushes a datagram; it is shared by every peer the server
    /// creates, so a single real socket send can back all of them.
    /// `on_error` reports recoverable errors (malformed or spoofed
    /// datagrams, failed handshakes) that are otherwise only logged.
    pub fn new(
        config: KcpConfig,
        send_to: impl FnMut(SocketAddr, &[u8]) -> io::Result<()> + 'static,
        on_error: impl FnMut(Error) + 'static,
    ) -> Self {
        Server {
            peers: HashMap::new(),
            addrs: HashMap::new(),
            config,
            send_to: Rc::new(RefCell::new(send_to)),
            on_error: Rc::new(RefCell::new(on_error)),
        }
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn remote_addr(&self, connection_id: ConnectionId) -> Option<SocketAddr> {
        self.addrs.get(&connection_id).copied()
    }

    fn raw_send_for(&self, addr: SocketAddr) -> impl FnMut(&[u8]) -> io::Result<()> {
        let send_to = Rc::clone(&self.send_to);
        move |buf: &[u8]| (send_to.borrow_mut())(addr, buf)
    }

    fn on_error_for(&self) -> impl FnMut(Error) + 'static {
        let on_error = Rc::clone(&self.on_error);
        move |err: Error| (on_error.borrow_mut())(err)
    }

    /// Feed one datagram received from `remote_addr`. Routes it to an
    /// existing peer, or, for an unrecognized address, stands up a
    /// provisional server-role peer and admits it only if the datagram
    /// completes the handshake.
    pub fn handle_datagram(
        &mut self,
        remote_addr: SocketAddr,
        datagram: &[u8],
        now_ms: u32,
    ) -> KcpResult<Vec<ServerEvent>> {
        let connection_id = connection_id_for(remote_addr);

        if let Some(peer) = self.peers.get_mut(&connection_id) {
            return match peer.tick_incoming(datagram, now_ms) {
                Ok(events) => Ok(self.translate_and_collect_removals(connection_id, events)),
                Err(err) => {
                    debug!("server: dropping malformed datagram from {}: {}", remote_addr, err);
                    (self.on_error.borrow_mut())(err);
                    Ok(Vec::new())
                }
            };
        }

        self.admit(connection_id, remote_addr, datagram, now_ms)
    }

    fn admit(
        &mut self,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        datagram: &[u8],
        now_ms: u32,
    ) -> KcpResult<Vec<ServerEvent>> {
        const OUTER_HEADER_LEN: usize = 1 + 4;
        if datagram.len() < OUTER_HEADER_LEN + segment::KCP_OVERHEAD {
            debug!("server: dropping datagram from unknown address {}, no handshake possible", remote_addr);
            return Ok(Vec::new());
        }
        match Channel::from_byte(datagram[0]) {
            Ok(Channel::Reliable) => {}
            Ok(_) => {
                debug!("server: dropping non-handshake datagram from unknown address {}", remote_addr);
                return Ok(Vec::new());
            }
            Err(err) => {
                debug!("server: dropping datagram with {} from unknown address {}", err, remote_addr);
                (self.on_error.borrow_mut())(err);
                return Ok(Vec::new());
            }
        }
        let conv = segment::get_conv(&datagram[OUTER_HEADER_LEN..]);

        let cookie = rand::random::<u32>();
        let raw_send = self.raw_send_for(remote_addr);
        let on_error = self.on_error_for();
        let mut peer = Peer::new(Role::Server, cookie, conv, &self.config, now_ms, raw_send, on_error);

        let events = match peer.tick_incoming(datagram, now_ms) {
            Ok(events) => events,
            Err(err) => {
                debug!("server: provisional peer from {} failed handshake: {}", remote_addr, err);
                (self.on_error.borrow_mut())(err);
                return Ok(Vec::new());
            }
        };

        if !peer.is_authenticated() {
            debug!("server: provisional peer from {} not authenticated after first datagram, dropping", remote_addr);
            return Ok(Vec::new());
        }

        self.peers.insert(connection_id, peer);
        self.addrs.insert(connection_id, remote_addr);

        // `events` already carries `PeerEvent::Connected`, pushed by the
        // peer itself the moment its state flipped to Authenticated.
        Ok(self.translate_and_collect_removals(connection_id, events))
    }

    fn translate_and_collect_removals(
        &mut self,
        connection_id: ConnectionId,
        events: Vec<PeerEvent>,
    ) -> Vec<ServerEvent> {
        let mut out = Vec::with_capacity(events.len());
        let mut disconnected = false;
        for event in events {
            match event {
                PeerEvent::Connected => out.push(ServerEvent::Connected(connection_id)),
                PeerEvent::Message { channel, payload } => out.push(ServerEvent::Message {
                    connection_id,
                    channel,
                    payload,
                }),
                PeerEvent::Disconnected(reason) => {
                    disconnected = true;
                    out.push(ServerEvent::Disconnected(connection_id, reason));
                }
            }
        }
        if disconnected {
            self.peers.remove(&connection_id);
            self.addrs.remove(&connection_id);
        }
        out
    }

    /// Send an application payload to an authenticated connection.
    pub fn send(&mut self, connection_id: ConnectionId, payload: &[u8], channel: Channel) -> KcpResult<()> {
        let peer = self.peers.get_mut(&connection_id).ok_or(crate::Error::NotConnected)?;
        peer.send(payload, channel)
    }

    /// Begin a graceful close of one connection. Removal happens on the
    /// next [`Server::tick_outgoing`] once the goodbye has flushed.
    pub fn disconnect(&mut self, connection_id: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&connection_id) {
            peer.disconnect();
        }
    }

    /// Drive every connection's clock, flush pending output, and reap
    /// any connection that reached `Disconnected` this tick. The removal
    /// set is collected during the iteration and applied afterward so the
    /// peer map is never mutated while being walked.
    pub fn tick_outgoing(&mut self, now_ms: u32) -> KcpResult<Vec<ServerEvent>> {
        let mut all_events = Vec::new();
        let mut to_remove = Vec::new();

        for (&connection_id, peer) in self.peers.iter_mut() {
            let events = peer.tick_outgoing(now_ms)?;
            for event in events {
                match event {
                    PeerEvent::Connected => all_events.push(ServerEvent::Connected(connection_id)),
                    PeerEvent::Message { channel, payload } => all_events.push(ServerEvent::Message {
                        connection_id,
                        channel,
                        payload,
                    }),
                    PeerEvent::Disconnected(reason) => {
                        to_remove.push(connection_id);
                        all_events.push(ServerEvent::Disconnected(connection_id, reason));
                    }
                }
            }
        }

        for connection_id in to_remove {
            self.peers.remove(&connection_id);
            self.addrs.remove(&connection_id);
        }

        Ok(all_events)
    }
}
