use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::arq::{KcpError, CMD_ACK, CMD_PUSH, CMD_WASK, CMD_WINS, OVERHEAD};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Default)]
pub(super) struct Segment {
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
    pub data: Bytes,
}

impl Segment {
    pub fn with_data(data: Bytes) -> Segment {
        Segment {
            data,
            ..Default::default()
        }
    }

    pub fn encode_header(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len().prechecked_cast());
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.encode_header(buf);
        buf.put_slice(&self.data);
    }

    pub fn encoded_len(&self) -> usize {
        OVERHEAD + self.data.len()
    }
}

/// Header fields as parsed from the wire, the payload is referenced by the caller's buffer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(super) struct SegmentHeader {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: usize,
}

impl SegmentHeader {
    /// Parses the next header, checking that its payload is completely contained in `buf`
    pub fn deser(buf: &mut impl Buf) -> Result<SegmentHeader, KcpError> {
        if buf.remaining() < OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let header = SegmentHeader {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le().safe_cast(),
        };

        if buf.remaining() < header.len {
            return Err(KcpError::Truncated);
        }
        if !matches!(header.cmd, CMD_PUSH | CMD_ACK | CMD_WASK | CMD_WINS) {
            return Err(KcpError::UnknownCommand(header.cmd));
        }
        Ok(header)
    }
}
