use std::io::{self, ErrorKind};

use thiserror::Error;

/// Errors produced by the KCP engine and the peer/session layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("conv inconsistent, expected {0}, found {1}")]
    ConvInconsistent(u32, u32),

    #[error("invalid mtu {0}")]
    InvalidMtu(usize),

    #[error("invalid segment size of {0}")]
    InvalidSegmentSize(usize),

    #[error("invalid segment data size, expected {0}, found {1}")]
    InvalidSegmentDataSize(usize, usize),

    #[error("cmd {0} is not supported")]
    UnsupportedCmd(u8),

    #[error("need call kcp's update method")]
    NeedUpdate,

    #[error("receive queue is empty")]
    RecvQueueEmpty,

    #[error("expecting other fragments")]
    ExpectingFragment,

    #[error("user's buffer is too big, {0} bytes exceeds the fragment budget of the receive window")]
    UserBufTooBig(usize),

    #[error("user's buffer is too small, need {0} bytes, got {1}")]
    UserBufTooSmall(usize, usize),

    #[error("peer is not authenticated yet")]
    NotConnected,

    #[error("peer connection has been closed")]
    ConnectionClosed,

    #[error("datagram carries an unknown or mismatched cookie")]
    InvalidCookie,

    #[error("message is empty")]
    EmptySend,

    #[error("message of {0} bytes exceeds the {1}-byte limit for this channel")]
    MessageTooLarge(usize, usize),

    #[error("datagram is too short to carry a channel/cookie header")]
    ShortHeader,

    #[error("unknown channel byte {0}")]
    InvalidChannel(u8),

    #[error("unknown opcode byte {0}")]
    InvalidOpcode(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::Io(_) => ErrorKind::Other, // overwritten below
            Error::RecvQueueEmpty | Error::ExpectingFragment => ErrorKind::WouldBlock,
            Error::ConnectionClosed => ErrorKind::NotConnected,
            _ => ErrorKind::Other,
        };
        match err {
            Error::Io(io_err) => io_err,
            other => io::Error::new(kind, other.to_string()),
        }
    }
}
