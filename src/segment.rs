//! Wire segment encoding and a small freelist pool for segment payload buffers.

use bytes::{Buf, BufMut, BytesMut};

pub const CMD_PUSH: u8 = 81; // cmd: push data
pub const CMD_ACK: u8 = 82; // cmd: ack
pub const CMD_WASK: u8 = 83; // cmd: window probe (ask)
pub const CMD_WINS: u8 = 84; // cmd: window size (tell)

pub const KCP_OVERHEAD: usize = 24;

/// Read `conv` from a raw buffer without fully decoding it.
pub fn get_conv(mut buf: &[u8]) -> u32 {
    assert!(buf.len() >= KCP_OVERHEAD);
    buf.get_u32_le()
}

/// Set `conv` on a raw buffer in place.
pub fn set_conv(mut buf: &mut [u8], conv: u32) {
    assert!(buf.len() >= KCP_OVERHEAD);
    buf.put_u32_le(conv)
}

/// Get `sn` from a raw buffer without fully decoding it.
pub fn get_sn(buf: &[u8]) -> u32 {
    assert!(buf.len() >= KCP_OVERHEAD);
    (&buf[12..]).get_u32_le()
}

#[derive(Default, Clone, Debug)]
pub(crate) struct KcpSegment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
    pub data: BytesMut,
}

impl KcpSegment {
    fn new_with_data(data: BytesMut) -> Self {
        KcpSegment {
            data,
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(buf.remaining_mut() >= self.encoded_len());

        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    pub fn encoded_len(&self) -> usize {
        KCP_OVERHEAD + self.data.len()
    }
}

/// A tiny freelist for segment payload buffers.
///
/// KCP churns through many small `BytesMut` allocations per flush under a
/// busy window; reusing cleared buffers instead of dropping them keeps
/// steady-state allocation bounded to the working-set size of the window,
/// per the pooling design note.
#[derive(Default)]
pub(crate) struct SegmentPool {
    free: Vec<BytesMut>,
}

impl SegmentPool {
    pub fn new() -> Self {
        SegmentPool { free: Vec::new() }
    }

    /// Take a segment carrying `data`, reusing a pooled payload buffer if one
    /// is free and large enough, otherwise allocating one.
    pub fn acquire(&mut self, data: &[u8]) -> KcpSegment {
        let mut buf = match self.free.pop() {
            Some(mut b) => {
                b.clear();
                b
            }
            None => BytesMut::with_capacity(data.len()),
        };
        buf.extend_from_slice(data);
        KcpSegment::new_with_data(buf)
    }

    /// An empty segment (used for outgoing PUSH segments carved from a send
    /// queue entry, and for header-only ACK/WASK/WINS segments).
    pub fn acquire_empty(&mut self) -> BytesMut {
        match self.free.pop() {
            Some(mut b) => {
                b.clear();
                b
            }
            None => BytesMut::new(),
        }
    }

    /// Return a segment's payload buffer to the pool.
    pub fn release(&mut self, mut segment: KcpSegment) {
        segment.data.clear();
        self.free.push(segment.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_byte_layout_matches_spec() {
        let seg = KcpSegment {
            conv: 0x0403_0201,
            cmd: 0x05,
            frg: 0x06,
            wnd: 0x0807,
            ts: 0x0C0B_0A09,
            sn: 0x100F_0E0D,
            una: 0x1413_1211,
            data: BytesMut::new(),
            ..Default::default()
        };

        let mut buf = BytesMut::with_capacity(seg.encoded_len());
        seg.encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
                0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x00, 0x00, 0x00, 0x00,
            ][..]
        );
    }

    #[test]
    fn get_conv_and_set_conv_round_trip() {
        let mut buf = vec![0u8; KCP_OVERHEAD];
        set_conv(&mut buf, 0xdead_beef);
        assert_eq!(get_conv(&buf), 0xdead_beef);
    }

    #[test]
    fn pool_reuses_released_buffers() {
        let mut pool = SegmentPool::new();
        let seg = pool.acquire(b"hello");
        assert_eq!(&seg.data[..], b"hello");
        pool.release(seg);

        let seg2 = pool.acquire(b"world");
        assert_eq!(&seg2.data[..], b"world");
        // The pool had exactly one buffer to recycle.
        assert!(pool.free.is_empty());
    }
}
