//! Per-remote-peer session state: wraps one [`Kcp`] engine, adds the outer
//! channel/cookie framing, the handshake, keepalive pings, and
//! timeout/dead-link/choke detection.

use std::cell::Cell;
use std::io::{self, Write};
use std::rc::Rc;

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::{Channel, Opcode};
use crate::config::KcpConfig;
use crate::error::Error;
use crate::kcp::Kcp;
use crate::KcpResult;

/// Outer-framing overhead reserved on every datagram: 1 channel byte + 4
/// cookie bytes. The engine's own MTU is shrunk by this much so a flushed
/// KCP datagram always has room for the peer-layer header once wrapped.
const OUTER_HEADER_LEN: usize = 1 + 4;

/// Combined queue length (`snd_queue + snd_buf + rcv_queue + rcv_buf`) past
/// which a peer is assumed unable to keep up and is disconnected.
const QUEUE_DISCONNECT_THRESHOLD: usize = 10_000;

/// Which side of the handshake a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first Hello on creation.
    Client,
    /// Waits for a Hello before replying.
    Server,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Handshake in progress; cookie checks are not yet enforced.
    Connecting,
    /// Handshake complete; normal traffic flows.
    Authenticated,
    /// Local or remote end initiated a close; draining the goodbye.
    Disconnecting,
    /// Terminal; the owner should remove this peer.
    Disconnected,
}

/// Why a peer transitioned to [`PeerState::Disconnecting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No datagram passed cookie validation for `Timeout`.
    Timeout,
    /// A segment exceeded `max_retransmits` without acknowledgement.
    DeadLink,
    /// Combined queue length reached `QUEUE_DISCONNECT_THRESHOLD`.
    Choke,
    /// The remote end sent an explicit Disconnect.
    Remote,
    /// `disconnect()` was called locally.
    Local,
}

/// Something that happened to a peer during a tick, handed back to the
/// embedder to dispatch to application callbacks.
#[derive(Debug)]
pub enum PeerEvent {
    /// The handshake completed; the peer is now usable for `send`.
    Connected,
    /// A complete application message arrived on `channel`.
    Message { channel: Channel, payload: Vec<u8> },
    /// The peer reached `Disconnected`; it should be dropped by the owner.
    Disconnected(DisconnectReason),
}

/// Adapter between the KCP engine's `Write` output and the peer's outer
/// framing: every flushed chunk gets a channel byte and cookie prepended
/// and is appended to a shared outgoing queue, drained by `tick_outgoing`.
#[derive(Clone)]
struct FramingOutput {
    cookie: Rc<Cell<u32>>,
    outgoing: Rc<std::cell::RefCell<Vec<Vec<u8>>>>,
}

impl Write for FramingOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut framed = BytesMut::with_capacity(OUTER_HEADER_LEN + buf.len());
        framed.put_u8(Channel::Reliable.to_byte());
        framed.put_u32_le(self.cookie.get());
        framed.put_slice(buf);
        self.outgoing.borrow_mut().push(framed.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One remote endpoint's reliable+unreliable session.
pub struct Peer {
    kcp: Kcp<FramingOutput>,
    outgoing: Rc<std::cell::RefCell<Vec<Vec<u8>>>>,
    cookie: Rc<Cell<u32>>,

    role: Role,
    state: PeerState,

    last_receive_time: u32,
    last_ping_time: u32,

    timeout_ms: u32,
    ping_interval_ms: u32,

    mss_effective: usize,
    rcv_wnd: u16,
    mtu: usize,
    message_buffer: Vec<u8>,

    paused: bool,

    raw_send: Box<dyn FnMut(&[u8]) -> io::Result<()>>,
    on_error: Box<dyn FnMut(Error)>,
}

impl Peer {
    /// Build a peer with a fresh cookie (server role assigns a random one;
    /// client role starts at 0 until the server's Hello supplies the real
    /// value). `on_error` reports recoverable, single-datagram errors that
    /// would otherwise only reach a log line.
    pub fn new(
        role: Role,
        cookie: u32,
        conv: u32,
        config: &KcpConfig,
        now_ms: u32,
        raw_send: impl FnMut(&[u8]) -> io::Result<()> + 'static,
        on_error: impl FnMut(Error) + 'static,
    ) -> Self {
        let cookie = Rc::new(Cell::new(cookie));
        let outgoing = Rc::new(std::cell::RefCell::new(Vec::new()));

        let output = FramingOutput {
            cookie: Rc::clone(&cookie),
            outgoing: Rc::clone(&outgoing),
        };

        let mut kcp = Kcp::new(conv, output);
        config.apply_to(&mut kcp);
        // Reserve room for the outer channel+cookie header on every
        // datagram the engine packs, since the engine itself only knows
        // about its own 24-byte segment header.
        let _ = kcp.set_mtu(config.mtu.saturating_sub(OUTER_HEADER_LEN));
        let _ = kcp.update(now_ms);

        let mss_effective = config.mtu.saturating_sub(OUTER_HEADER_LEN).saturating_sub(24);
        let max_frags = std::cmp::min(config.receive_window_size as usize, 255).saturating_sub(1);
        let max_reliable_message_size = mss_effective.saturating_mul(max_frags).saturating_sub(1);

        let mut peer = Peer {
            kcp,
            outgoing,
            cookie,
            role,
            state: PeerState::Connecting,
            last_receive_time: now_ms,
            last_ping_time: now_ms,
            timeout_ms: config.timeout.as_millis() as u32,
            ping_interval_ms: config.ping_interval.as_millis() as u32,
            mss_effective,
            rcv_wnd: config.receive_window_size,
            mtu: config.mtu,
            message_buffer: vec![0u8; 1 + max_reliable_message_size],
            paused: false,
            raw_send: Box::new(raw_send),
            on_error: Box::new(on_error),
        };

        if role == Role::Client {
            // A handshake failure here means the outgoing queue couldn't
            // hold the framed bytes, which cannot happen for an in-memory
            // Vec; logged defensively rather than propagated to the
            // constructor's infallible signature.
            if let Err(err) = peer.send_control_opcode(Opcode::Hello, &[]) {
                warn!("peer: failed to send initial hello: {}", err);
                (peer.on_error)(err);
            }
        }

        peer
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[inline]
    pub fn cookie(&self) -> u32 {
        self.cookie.get()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.state == PeerState::Authenticated
    }

    /// Short-circuit delivery to the application without halting the KCP
    /// state machine; see the pause/resume design note.
    pub fn set_paused(&mut self, paused: bool, now_ms: u32) {
        if self.paused && !paused {
            self.last_receive_time = now_ms;
        }
        self.paused = paused;
    }

    fn max_reliable_message_size(&self) -> usize {
        let max_frags = std::cmp::min(self.rcv_wnd as usize, 255).saturating_sub(1);
        self.mss_effective.saturating_mul(max_frags).saturating_sub(1)
    }

    fn max_unreliable_message_size(&self) -> usize {
        self.mtu.saturating_sub(OUTER_HEADER_LEN).saturating_sub(1)
    }

    /// Queue an application payload for delivery on `channel`.
    pub fn send(&mut self, payload: &[u8], channel: Channel) -> KcpResult<()> {
        if payload.is_empty() {
            return Err(Error::EmptySend);
        }
        match self.state {
            PeerState::Authenticated => {}
            PeerState::Disconnecting | PeerState::Disconnected => return Err(Error::ConnectionClosed),
            PeerState::Connecting => return Err(Error::NotConnected),
        }

        match channel {
            Channel::Reliable => {
                let limit = self.max_reliable_message_size();
                if payload.len() > limit {
                    return Err(Error::MessageTooLarge(payload.len(), limit));
                }
                self.send_opcode(Opcode::Data, payload)
            }
            Channel::Unreliable => {
                let limit = self.max_unreliable_message_size();
                if payload.len() > limit {
                    return Err(Error::MessageTooLarge(payload.len(), limit));
                }
                self.send_unreliable_opcode(Opcode::Data, payload)
            }
        }
    }

    /// Queue an opcode message on the reliable stream. Left to the normal
    /// flush cadence so ordinary `Data` sends keep batching.
    fn send_opcode(&mut self, opcode: Opcode, payload: &[u8]) -> KcpResult<()> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(opcode.to_byte());
        message.extend_from_slice(payload);
        self.kcp.send(&message)?;
        Ok(())
    }

    /// Like `send_opcode`, but flushes immediately instead of waiting for
    /// the next scheduled tick. Used for Hello/Ping/Disconnect, which are
    /// latency-sensitive and too small to benefit from batching.
    fn send_control_opcode(&mut self, opcode: Opcode, payload: &[u8]) -> KcpResult<()> {
        self.send_opcode(opcode, payload)?;
        self.kcp.flush()?;
        Ok(())
    }

    fn send_unreliable_opcode(&mut self, opcode: Opcode, payload: &[u8]) -> KcpResult<()> {
        let mut framed = BytesMut::with_capacity(OUTER_HEADER_LEN + 1 + payload.len());
        framed.put_u8(Channel::Unreliable.to_byte());
        framed.put_u32_le(self.cookie.get());
        framed.put_u8(opcode.to_byte());
        framed.put_slice(payload);
        (self.raw_send)(&framed)?;
        Ok(())
    }

    /// Begin a graceful local close.
    pub fn disconnect(&mut self) {
        if self.state == PeerState::Disconnecting || self.state == PeerState::Disconnected {
            return;
        }
        if self.state == PeerState::Authenticated {
            let _ = self.send_control_opcode(Opcode::Disconnect, &[]);
        }
        self.state = PeerState::Disconnecting;
    }

    fn begin_disconnect(&mut self, events: &mut Vec<PeerEvent>, reason: DisconnectReason) {
        if self.state == PeerState::Disconnecting || self.state == PeerState::Disconnected {
            return;
        }
        warn!("peer: disconnecting, reason={:?}", reason);
        self.state = PeerState::Disconnecting;
        // Breaks reentrancy: state is already Disconnected before the
        // caller observes the event.
        self.state = PeerState::Disconnected;
        events.push(PeerEvent::Disconnected(reason));
    }

    fn accepts_cookie(&self, incoming: u32) -> bool {
        match self.state {
            PeerState::Connecting => true,
            _ => incoming == self.cookie.get(),
        }
    }

    /// Feed one raw datagram (the full UDP payload, channel byte and
    /// cookie included) received from the remote address owning this
    /// peer.
    pub fn tick_incoming(&mut self, datagram: &[u8], now_ms: u32) -> KcpResult<Vec<PeerEvent>> {
        let mut events = Vec::new();

        if datagram.len() < OUTER_HEADER_LEN {
            return Err(Error::ShortHeader);
        }

        let mut cur = datagram;
        let channel_byte = cur.get_u8();
        let channel = Channel::from_byte(channel_byte)?;
        let incoming_cookie = cur.get_u32_le();

        if !self.accepts_cookie(incoming_cookie) {
            debug!("peer: dropping datagram with mismatched cookie");
            return Err(Error::InvalidCookie);
        }

        self.last_receive_time = now_ms;

        if self.role == Role::Client && self.state == PeerState::Connecting {
            // Learn the server-assigned cookie from whichever datagram
            // first carries one.
            self.cookie.set(incoming_cookie);
        }

        match channel {
            Channel::Reliable => {
                self.kcp.input(cur)?;

                let mut buf = std::mem::take(&mut self.message_buffer);
                let result = (|| -> KcpResult<()> {
                    loop {
                        let size = match self.kcp.recv(&mut buf) {
                            Ok(n) => n,
                            Err(Error::RecvQueueEmpty) => break,
                            Err(e) => return Err(e),
                        };
                        self.handle_reliable_message(&buf[..size], &mut events)?;
                    }
                    Ok(())
                })();
                self.message_buffer = buf;
                result?;
            }
            Channel::Unreliable => {
                if cur.is_empty() {
                    return Err(Error::ShortHeader);
                }
                let opcode = Opcode::from_byte(cur[0])?;
                let payload = cur[1..].to_vec();
                let limit = self.max_unreliable_message_size();
                if payload.len() > limit {
                    let err = Error::MessageTooLarge(payload.len(), limit);
                    debug!("peer: dropping oversized unreliable datagram: {}", err);
                    (self.on_error)(err);
                } else if opcode == Opcode::Data && self.state == PeerState::Authenticated && !self.paused {
                    events.push(PeerEvent::Message {
                        channel: Channel::Unreliable,
                        payload,
                    });
                }
            }
        }

        self.evaluate_health(now_ms, &mut events);

        Ok(events)
    }

    fn handle_reliable_message(&mut self, message: &[u8], events: &mut Vec<PeerEvent>) -> KcpResult<()> {
        if message.is_empty() {
            return Err(Error::ShortHeader);
        }
        let opcode = Opcode::from_byte(message[0])?;
        let payload = &message[1..];

        match opcode {
            Opcode::Hello => {
                if self.state == PeerState::Connecting {
                    self.state = PeerState::Authenticated;
                    if self.role == Role::Server {
                        // Echo a Hello back, now framed with our own
                        // cookie via FramingOutput.
                        self.send_control_opcode(Opcode::Hello, &[])?;
                    }
                    events.push(PeerEvent::Connected);
                }
            }
            Opcode::Ping => {
                // Keepalive: last_receive_time was already bumped above.
            }
            Opcode::Data => {
                if self.state == PeerState::Authenticated && !self.paused {
                    events.push(PeerEvent::Message {
                        channel: Channel::Reliable,
                        payload: payload.to_vec(),
                    });
                }
            }
            Opcode::Disconnect => {
                self.begin_disconnect(events, DisconnectReason::Remote);
            }
        }

        Ok(())
    }

    fn evaluate_health(&mut self, now_ms: u32, events: &mut Vec<PeerEvent>) {
        if self.state == PeerState::Disconnected {
            return;
        }

        let silence = now_ms.wrapping_sub(self.last_receive_time);
        if silence >= self.timeout_ms {
            self.begin_disconnect(events, DisconnectReason::Timeout);
            return;
        }

        if self.kcp.is_dead_link() {
            self.begin_disconnect(events, DisconnectReason::DeadLink);
            return;
        }

        let queued = self.kcp.wait_snd() + self.kcp.rcv_queue_len() + self.kcp.rcv_buf_len();
        if queued >= QUEUE_DISCONNECT_THRESHOLD {
            self.begin_disconnect(events, DisconnectReason::Choke);
        }
    }

    /// Drive the engine's clock, send the periodic ping, evaluate health,
    /// and flush any framed datagrams through `raw_send`.
    pub fn tick_outgoing(&mut self, now_ms: u32) -> KcpResult<Vec<PeerEvent>> {
        let mut events = Vec::new();

        if self.state == PeerState::Disconnected {
            return Ok(events);
        }

        if self.state == PeerState::Authenticated
            && now_ms.wrapping_sub(self.last_ping_time) >= self.ping_interval_ms
        {
            self.last_ping_time = now_ms;
            self.send_control_opcode(Opcode::Ping, &[])?;
        }

        self.kcp.update(now_ms)?;
        self.evaluate_health(now_ms, &mut events);

        for datagram in self.outgoing.borrow_mut().drain(..) {
            (self.raw_send)(&datagram)?;
        }

        if self.state == PeerState::Disconnecting {
            self.state = PeerState::Disconnected;
            events.push(PeerEvent::Disconnected(DisconnectReason::Local));
        }

        Ok(events)
    }
}
