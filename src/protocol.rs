use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::arq;
use crate::config::KcpMode;

/// Protocol marker in the first four bytes of every datagram. Control packets carry it
///  unchanged, data packets carry a conv which has the marker in its upper 24 bits.
pub const KCP_FLAG: u32 = 0x4B43_5000;
pub const KCP_MASK: u32 = 0xFFFF_FF00;
/// Size of the conv index space. Index 0 is reserved, it would make a conv indistinguishable
///  from the control flag.
pub const KCP_MAX_CONV: usize = 256;
pub const MTU_SIZE: usize = 1400;

#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum SynCommand {
    Syn = 0,
    Ack = 1,
    Fin = 2,
    Rst = 3,
}

/// Header of connection control packets (SYN / ACK / FIN / RST).
///
/// ```ascii
///  0: flag (u32) - KCP_FLAG
///  4: conv (u32) - 0 in a SYN, the assigned conv otherwise
///  8: mode (u16)
/// 10: command (u16)
/// 12: sn (u32) - correlates requests and replies
/// 16: send window size (u32)
/// 20: receive window size (u32)
/// ```
///
/// All numbers are little endian, like the engine's segment header, which has the same size.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlHeader {
    pub flag: u32,
    pub conv: u32,
    pub mode: KcpMode,
    pub command: SynCommand,
    pub sn: u32,
    pub send_win_size: u32,
    pub recv_win_size: u32,
}

const _: () = assert!(ControlHeader::SERIALIZED_LEN == arq::OVERHEAD);

impl ControlHeader {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn new(conv: u32, mode: KcpMode, command: SynCommand, sn: u32, send_win_size: u32, recv_win_size: u32) -> ControlHeader {
        ControlHeader {
            flag: KCP_FLAG,
            conv,
            mode,
            command,
            sn,
            send_win_size,
            recv_win_size,
        }
    }

    /// A reply to this header, echoing mode, sn and window sizes
    pub fn reply(&self, conv: u32, command: SynCommand) -> ControlHeader {
        ControlHeader::new(conv, self.mode, command, self.sn, self.send_win_size, self.recv_win_size)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.flag);
        buf.put_u32_le(self.conv);
        buf.put_u16_le(self.mode.into());
        buf.put_u16_le(self.command.into());
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.send_win_size);
        buf.put_u32_le(self.recv_win_size);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("control header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let flag = buf.get_u32_le();
        let conv = buf.get_u32_le();
        let mode = KcpMode::try_from(buf.get_u16_le())?;
        let command = SynCommand::try_from(buf.get_u16_le())?;
        let sn = buf.get_u32_le();
        let send_win_size = buf.get_u32_le();
        let recv_win_size = buf.get_u32_le();

        if flag != KCP_FLAG {
            bail!("not a control header: flag {:#x}", flag);
        }

        Ok(ControlHeader {
            flag,
            conv,
            mode,
            command,
            sn,
            send_win_size,
            recv_win_size,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketKind {
    Control,
    Data { conv: u32 },
    Unknown { flag: u32 },
}

/// Classifies a datagram by its leading flag. Datagrams shorter than a header are not
///  classified at all.
pub fn classify(datagram: &[u8]) -> Option<PacketKind> {
    if datagram.len() < ControlHeader::SERIALIZED_LEN {
        return None;
    }

    let flag = (&datagram[..4]).get_u32_le();
    let kind = if flag == KCP_FLAG {
        PacketKind::Control
    }
    else if flag & KCP_MASK == KCP_FLAG {
        PacketKind::Data { conv: flag }
    }
    else {
        PacketKind::Unknown { flag }
    };
    Some(kind)
}

pub fn conv_for_index(index: usize) -> u32 {
    debug_assert!(index > 0 && index < KCP_MAX_CONV);
    KCP_FLAG | (index as u32 & !KCP_MASK)
}

pub fn index_of_conv(conv: u32) -> Option<usize> {
    if conv & KCP_MASK != KCP_FLAG {
        return None;
    }
    match (conv & !KCP_MASK) as usize {
        0 => None,
        index => Some(index),
    }
}
