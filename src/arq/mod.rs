//! The ARQ engine: a KCP style sliding window protocol with selective retransmission, fast
//!  retransmit on duplicate ACKs and an optional congestion window.
//!
//! The engine does no I/O and reads no clock. Datagrams are fed in through [Kcp::input],
//!  outgoing segments leave through a [KcpOutput], and time advances only by calls to
//!  [Kcp::update].
//!
//! Segment header (24 bytes, little endian), followed by `len` bytes of payload:
//!
//! ```ascii
//!  0: conv (u32)
//!  4: cmd (u8) - PUSH, ACK, WASK (window probe), WINS (window size)
//!  5: frg (u8) - number of fragments of the same message following this one
//!  6: wnd (u16) - free slots in the sender's receive queue
//!  8: ts (u32) - send timestamp, echoed in the ACK for RTT estimation
//! 12: sn (u32) - segment sequence number
//! 16: una (u32) - all segments below this are received
//! 20: len (u32) - payload length
//! ```

mod segment;
mod kcp;

use std::fmt::{Display, Formatter};

pub use kcp::Kcp;

pub const OVERHEAD: usize = 24;

pub const RTO_NDL: u32 = 30;
pub const RTO_MIN: u32 = 100;
pub const RTO_DEF: u32 = 200;
pub const RTO_MAX: u32 = 60000;

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;
pub const CMD_WASK: u8 = 83;
pub const CMD_WINS: u8 = 84;

pub const ASK_SEND: u32 = 1;
pub const ASK_TELL: u32 = 2;

pub const WND_SND: u32 = 32;
pub const WND_RCV: u32 = 128;
pub const MTU_DEF: u32 = 1400;
pub const INTERVAL: u32 = 100;
pub const DEADLINK: u32 = 20;
pub const THRESH_INIT: u32 = 2;
pub const THRESH_MIN: u32 = 2;
pub const PROBE_INIT: u32 = 7000;
pub const PROBE_LIMIT: u32 = 120000;
pub const FASTACK_LIMIT: u32 = 5;

/// Sink for segments produced by the engine. Each call carries one datagram of at most
///  `mtu` bytes.
pub trait KcpOutput: Send {
    fn output(&mut self, packet: &[u8]);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KcpError {
    /// No complete message is available
    Empty,
    /// The message needs more fragments than the receive window can hold
    MessageTooLarge,
    /// Fewer bytes than a segment header
    Truncated,
    ConvMismatch { expected: u32, actual: u32 },
    UnknownCommand(u8),
    InvalidMtu(u32),
    /// The caller's buffer cannot hold the next message
    BufferTooSmall { required: usize },
}

impl Display for KcpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KcpError::Empty => write!(f, "no complete message available"),
            KcpError::MessageTooLarge => write!(f, "message exceeds the maximum number of fragments"),
            KcpError::Truncated => write!(f, "truncated segment"),
            KcpError::ConvMismatch { expected, actual } => write!(f, "conv mismatch: expected {:#x}, got {:#x}", expected, actual),
            KcpError::UnknownCommand(cmd) => write!(f, "unknown segment command {}", cmd),
            KcpError::InvalidMtu(mtu) => write!(f, "invalid mtu {}", mtu),
            KcpError::BufferTooSmall { required } => write!(f, "buffer too small, {} bytes required", required),
        }
    }
}

impl std::error::Error for KcpError {}

/// Signed distance between two points on the wrapping 32 bit sequence / time line
#[inline]
pub fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
