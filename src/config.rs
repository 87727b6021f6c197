//! Tunable knobs for the KCP engine and the peer layer sitting on top of it,
//! collected into one struct so callers configure a [`Peer`](crate::Peer) or
//! [`Server`](crate::Server) in one place instead of calling a dozen setters.

use std::io::Write;
use std::time::Duration;

use crate::kcp::Kcp;

/// Configuration applied to a [`Peer`](crate::Peer) at construction time.
///
/// The defaults mirror the KCP "normal mode" plus this crate's own
/// handshake/timeout defaults; callers reaching for lower latency typically
/// set `no_delay` true, tighten `interval`, and raise `fast_resend`.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    /// Enables the low-latency RTO floor and gentler backoff curve.
    pub no_delay: bool,
    /// Flush cadence in milliseconds, clamped to [10, 5000] by the engine.
    pub interval: u32,
    /// Duplicate-ACK count that triggers a fast retransmit; 0 disables it.
    pub fast_resend: u32,
    /// When `true`, runs the AIMD congestion window; when `false`
    /// (default), the send window is bounded only by `send_window_size`.
    pub congestion_window: bool,
    /// Segments in flight before `send` starts blocking on window space.
    pub send_window_size: u16,
    /// Segments buffered before in-order delivery to the application.
    pub receive_window_size: u16,
    /// Maximum transmission unit in bytes, including the 24-byte KCP
    /// header; payload capacity per segment is `mtu - 24`.
    pub mtu: usize,
    /// A peer with no received datagram for this long is timed out.
    pub timeout: Duration,
    /// Segments retransmitted this many times without ACK mark the link
    /// dead.
    pub max_retransmits: u32,
    /// Interval between outgoing keepalive pings once authenticated.
    pub ping_interval: Duration,
    /// Bind IPv6 with IPv4-mapped support when available. Accepted and
    /// stored for the embedder's own socket setup; this crate has no
    /// socket of its own to act on it.
    pub dual_mode: bool,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            no_delay: true,
            interval: 10,
            fast_resend: 2,
            congestion_window: false,
            send_window_size: 32,
            receive_window_size: 128,
            mtu: 1200,
            timeout: Duration::from_secs(10),
            max_retransmits: 40,
            ping_interval: Duration::from_secs(1),
            dual_mode: false,
        }
    }
}

impl KcpConfig {
    /// Apply this configuration's engine-level fields onto a freshly
    /// constructed [`Kcp`] control block.
    pub(crate) fn apply_to<O: Write>(&self, kcp: &mut Kcp<O>) {
        kcp.set_nodelay(
            self.no_delay,
            self.interval as i32,
            self.fast_resend as i32,
            !self.congestion_window,
        );
        kcp.set_wndsize(self.send_window_size, self.receive_window_size);
        // set_mtu only fails below the protocol's 50-byte floor; `mtu` is a
        // plain struct field so this can't be upheld at the type level.
        let _ = kcp.set_mtu(self.mtu);
        kcp.set_maximum_resend_times(self.max_retransmits);
    }
}
