use std::collections::VecDeque;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;
use crate::arq::segment::{Segment, SegmentHeader};
use crate::arq::*;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// One end of an ARQ conversation.
///
/// Application messages are split into at most `WND_RCV - 1` fragments of `mss` bytes on
///  [Kcp::send] and reassembled in order on the receiving side. Queues:
/// * `snd_queue`: segments not yet inside the send window
/// * `snd_buf`: segments sent and waiting for their ACK, ordered by `sn`
/// * `rcv_buf`: received segments that are out of order, ordered by `sn`
/// * `rcv_queue`: in-order segments ready for [Kcp::recv]
pub struct Kcp<O: KcpOutput> {
    conv: u32,
    mtu: u32,
    mss: u32,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u32,
    probe_wait: u32,
    ts_probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    xmit: u32,

    nodelay: bool,
    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,
    dead_link: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    buffer: BytesMut,
    output: O,
}

impl<O: KcpOutput> Kcp<O> {
    pub fn new(conv: u32, output: O) -> Kcp<O> {
        Kcp {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - OVERHEAD as u32,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            incr: 0,
            probe: 0,
            probe_wait: 0,
            ts_probe: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            updated: false,
            xmit: 0,
            nodelay: false,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            dead_link: DEADLINK,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity(3 * (MTU_DEF as usize + OVERHEAD)),
            output,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss.safe_cast()
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    pub fn rx_rto(&self) -> u32 {
        self.rx_rto
    }

    /// The maximum message size accepted by [Kcp::send]
    pub fn max_message_size(&self) -> usize {
        let max_fragments: usize = WND_RCV.safe_cast();
        (max_fragments - 1) * self.mss()
    }

    /// Segments sent but not acknowledged, plus segments not sent yet
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// A segment was retransmitted `dead_link` times without being acknowledged
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn set_mtu(&mut self, mtu: u32) -> Result<(), KcpError> {
        if mtu < 50 || mtu < OVERHEAD as u32 {
            return Err(KcpError::InvalidMtu(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD as u32;
        let mtu: usize = mtu.safe_cast();
        self.buffer = BytesMut::with_capacity(3 * (mtu + OVERHEAD));
        Ok(())
    }

    /// Values of 0 leave the respective window unchanged. The receive window never shrinks
    ///  below the maximum fragment count.
    pub fn set_wndsize(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd.max(WND_RCV);
        }
    }

    /// Number of transmissions of a single segment after which the link is considered dead
    pub fn set_dead_link(&mut self, dead_link: u32) {
        self.dead_link = dead_link.max(1);
    }

    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NDL } else { RTO_MIN };
        self.interval = interval.clamp(10, 5000);
        self.fastresend = resend;
        self.nocwnd = nocwnd;
    }

    /// Queues a message for sending, splitting it into fragments. Nothing goes on the wire
    ///  before the next [Kcp::update].
    pub fn send(&mut self, data: &[u8]) -> Result<(), KcpError> {
        let mss = self.mss();
        let count = if data.len() <= mss {
            1
        }
        else {
            data.len().div_ceil(mss)
        };

        let max_fragments: usize = WND_RCV.safe_cast();
        if count >= max_fragments {
            return Err(KcpError::MessageTooLarge);
        }

        let mut remaining = data;
        for i in 0..count {
            let size = remaining.len().min(mss);
            let mut seg = Segment::with_data(Bytes::copy_from_slice(&remaining[..size]));
            seg.frg = (count - i - 1).prechecked_cast();
            self.snd_queue.push_back(seg);
            remaining = &remaining[size..];
        }
        Ok(())
    }

    /// Size of the next complete message in the receive queue, if there is one
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }

        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }

        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Appends the next complete message to `buf`, returning its size
    pub fn recv(&mut self, buf: &mut BytesMut) -> Result<usize, KcpError> {
        let size = self.peek_size().ok_or(KcpError::Empty)?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd_len();

        buf.reserve(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            buf.extend_from_slice(&seg.data);
            if seg.frg == 0 {
                break;
            }
        }

        self.move_rcv_buf_to_queue();

        // the peer was told our window was full: tell it about the free space right away
        if self.rcv_queue.len() < self.rcv_wnd_len() && recover {
            self.probe |= ASK_TELL;
        }
        Ok(size)
    }

    /// Like [Kcp::recv], but into a fixed size slice
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<usize, KcpError> {
        let size = self.peek_size().ok_or(KcpError::Empty)?;
        if size > buf.len() {
            return Err(KcpError::BufferTooSmall { required: size });
        }

        let mut scratch = BytesMut::with_capacity(size);
        self.recv(&mut scratch)?;
        buf[..size].copy_from_slice(&scratch);
        Ok(size)
    }

    /// Processes a datagram received from the peer. It may contain several segments.
    pub fn input(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if data.len() < OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<(u32, u32)> = None;

        let mut buf = data;
        while buf.len() >= OVERHEAD {
            let header = SegmentHeader::deser(&mut buf)?;
            if header.conv != self.conv {
                return Err(KcpError::ConvMismatch { expected: self.conv, actual: header.conv });
            }

            self.rmt_wnd = header.wnd as u32;
            if timediff(header.una, self.snd_nxt) > 0 {
                trace!("conv {:#x}: ignoring una {} beyond snd_nxt {}", self.conv, header.una, self.snd_nxt);
            }
            else {
                self.parse_una(header.una);
                self.shrink_buf();
            }

            match header.cmd {
                CMD_ACK => {
                    let rtt = timediff(self.current, header.ts);
                    if (0..=RTO_MAX as i32).contains(&rtt) {
                        self.update_ack(rtt);
                    }
                    else {
                        trace!("conv {:#x}: ignoring rtt sample {} from ts {}", self.conv, rtt, header.ts);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        Some((sn, _)) if timediff(header.sn, sn) <= 0 => max_ack,
                        _ => Some((header.sn, header.ts)),
                    };
                    trace!("conv {:#x}: ack sn={} rtt={} rto={}", self.conv, header.sn, rtt, self.rx_rto);
                }
                CMD_PUSH => {
                    if timediff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        if timediff(header.sn, self.rcv_nxt) >= 0 {
                            let seg = Segment {
                                conv: header.conv,
                                cmd: header.cmd,
                                frg: header.frg,
                                wnd: header.wnd,
                                ts: header.ts,
                                sn: header.sn,
                                una: header.una,
                                data: Bytes::copy_from_slice(&buf[..header.len]),
                                ..Default::default()
                            };
                            self.parse_data(seg);
                        }
                    }
                }
                CMD_WASK => {
                    self.probe |= ASK_TELL;
                }
                _ => {
                    // CMD_WINS: the window size was already taken from the header
                }
            }

            buf.advance(header.len);
        }

        if let Some((sn, ts)) = max_ack {
            self.parse_fastack(sn, ts);
        }

        if timediff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            self.grow_cwnd();
        }
        Ok(())
    }

    /// Advances the engine's clock, flushing when the update interval elapsed. `current` is a
    ///  millisecond timestamp that may wrap around.
    pub fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Timestamp at which [Kcp::update] should be called next
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10000..10000).contains(&timediff(current, ts_flush)) {
            ts_flush = current;
        }
        if timediff(current, ts_flush) >= 0 {
            return current;
        }

        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = timediff(seg.resendts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = tm_packet.min(diff);
        }

        let minimal = (tm_packet as u32)
            .min(timediff(ts_flush, current) as u32)
            .min(self.interval);
        current.wrapping_add(minimal)
    }

    /// Sends pending ACKs, window probes and all segments that are due
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let mtu: usize = self.mtu.safe_cast();
        let wnd: u16 = self.wnd_unused().min(u16::MAX as u32).prechecked_cast();

        let mut control = Segment {
            conv: self.conv,
            cmd: CMD_ACK,
            wnd,
            una: self.rcv_nxt,
            ..Default::default()
        };

        self.buffer.clear();
        for (sn, ts) in self.acklist.drain(..) {
            if self.buffer.len() + OVERHEAD > mtu {
                emit(&mut self.output, &mut self.buffer);
            }
            control.sn = sn;
            control.ts = ts;
            control.encode_header(&mut self.buffer);
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            }
            else if timediff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = self.probe_wait.min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        }
        else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        control.sn = 0;
        control.ts = 0;
        for (flag, cmd) in [(ASK_SEND, CMD_WASK), (ASK_TELL, CMD_WINS)] {
            if self.probe & flag != 0 {
                control.cmd = cmd;
                if self.buffer.len() + OVERHEAD > mtu {
                    emit(&mut self.output, &mut self.buffer);
                }
                control.encode_header(&mut self.buffer);
            }
        }
        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cwnd.min(self.cwnd);
        }

        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.conv = self.conv;
            seg.cmd = CMD_PUSH;
            seg.wnd = wnd;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 { self.fastresend } else { u32::MAX };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto.saturating_add(rtomin));
            }
            else if timediff(current, seg.resendts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                self.xmit += 1;
                if self.nodelay {
                    seg.rto = seg.rto.saturating_add(seg.rto / 2);
                }
                else {
                    seg.rto = seg.rto.saturating_add(seg.rto.max(self.rx_rto));
                }
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
            }
            else if seg.fastack >= resent && (seg.xmit <= self.fastlimit || self.fastlimit == 0) {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;

                if self.buffer.len() + seg.encoded_len() > mtu {
                    emit(&mut self.output, &mut self.buffer);
                }
                seg.encode(&mut self.buffer);

                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        emit(&mut self.output, &mut self.buffer);

        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh + resent.min(u32::MAX - self.ssthresh);
            self.incr = self.cwnd.saturating_mul(self.mss);
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss;
        }
    }

    fn rcv_wnd_len(&self) -> usize {
        self.rcv_wnd.safe_cast()
    }

    fn wnd_unused(&self) -> u32 {
        let queued: u32 = self.rcv_queue.len().prechecked_cast();
        self.rcv_wnd.saturating_sub(queued)
    }

    /// `rtt` must be in `0..=RTO_MAX`
    fn update_ack(&mut self, rtt: i32) {
        let rtt = i64::from(rtt);
        let max = i64::from(RTO_MAX);
        let (srtt, rttval) = if self.rx_srtt == 0 {
            (rtt, rtt / 2)
        }
        else {
            let srtt = i64::from(self.rx_srtt);
            let delta = (rtt - srtt).abs();
            ((7 * srtt + rtt) / 8, (3 * i64::from(self.rx_rttval) + delta) / 4)
        };
        let srtt = srtt.clamp(1, max);
        let rttval = rttval.clamp(0, max);
        self.rx_srtt = srtt.prechecked_cast();
        self.rx_rttval = rttval.prechecked_cast();

        let rto = srtt + i64::from(self.interval).max(4 * rttval);
        self.rx_rto = rto.clamp(i64::from(self.rx_minrto), max).prechecked_cast();
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if seg_sn == sn {
                self.snd_buf.remove(i);
                break;
            }
            if timediff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            }
            else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32, _ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for seg in self.snd_buf.iter_mut() {
            if timediff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || timediff(sn, self.rcv_nxt) < 0 {
            return;
        }

        let mut insert_at = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let existing = self.rcv_buf[i].sn;
            if existing == sn {
                repeat = true;
                break;
            }
            if timediff(sn, existing) > 0 {
                insert_at = i + 1;
                break;
            }
        }

        if !repeat {
            self.rcv_buf.insert(insert_at, seg);
        }

        self.move_rcv_buf_to_queue();
    }

    fn move_rcv_buf_to_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd_len() {
                if let Some(seg) = self.rcv_buf.pop_front() {
                    self.rcv_queue.push_back(seg);
                }
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
            else {
                break;
            }
        }
    }

    fn grow_cwnd(&mut self) {
        let mss = self.mss;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        }
        else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + mss / 16;
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd = (self.incr + mss - 1) / mss.max(1);
            }
        }

        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd * mss;
        }
    }
}

fn emit<O: KcpOutput>(output: &mut O, buffer: &mut BytesMut) {
    if !buffer.is_empty() {
        output.output(buffer);
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use rstest::rstest;
    use super::*;

    #[derive(Clone, Default)]
    struct Wire {
        packets: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }
    impl KcpOutput for Wire {
        fn output(&mut self, packet: &[u8]) {
            self.packets.lock().unwrap().push_back(packet.to_vec());
        }
    }
    impl Wire {
        fn take(&self) -> Vec<Vec<u8>> {
            self.packets.lock().unwrap().drain(..).collect()
        }
    }

    const CONV: u32 = 0x4B435001;

    fn pair(fast: bool) -> (Kcp<Wire>, Wire, Kcp<Wire>, Wire) {
        let a_wire = Wire::default();
        let b_wire = Wire::default();
        let mut a = Kcp::new(CONV, a_wire.clone());
        let mut b = Kcp::new(CONV, b_wire.clone());
        if fast {
            a.set_nodelay(true, 10, 2, true);
            b.set_nodelay(true, 10, 2, true);
        }
        (a, a_wire, b, b_wire)
    }

    /// runs both engines for `ms` milliseconds in steps of 10 ms, delivering every packet
    ///  for which `deliver` returns true
    fn run(a: &mut Kcp<Wire>, a_wire: &Wire, b: &mut Kcp<Wire>, b_wire: &Wire, start: u32, ms: u32, mut deliver: impl FnMut(&[u8]) -> bool) -> u32 {
        let mut now = start;
        while now < start + ms {
            a.update(now);
            b.update(now);
            for packet in a_wire.take() {
                if deliver(&packet) {
                    b.input(&packet).unwrap();
                }
            }
            for packet in b_wire.take() {
                if deliver(&packet) {
                    a.input(&packet).unwrap();
                }
            }
            now += 10;
        }
        now
    }

    fn drain_messages(kcp: &mut Kcp<Wire>) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while kcp.peek_size().is_some() {
            let mut buf = BytesMut::new();
            kcp.recv(&mut buf).unwrap();
            result.push(buf.to_vec());
        }
        result
    }

    #[rstest]
    #[case::normal(false)]
    #[case::fast(true)]
    fn test_round_trip_in_order(#[case] fast: bool) {
        let (mut a, a_wire, mut b, b_wire) = pair(fast);

        let messages: Vec<Vec<u8>> = (0..20u8)
            .map(|i| vec![i; 1 + i as usize * 100])
            .collect();
        for msg in &messages {
            a.send(msg).unwrap();
        }

        run(&mut a, &a_wire, &mut b, &b_wire, 0, 10_000, |_| true);

        assert_eq!(drain_messages(&mut b), messages);
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn test_fragmented_message() {
        let (mut a, a_wire, mut b, b_wire) = pair(true);

        let msg: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        a.send(&msg).unwrap();
        assert_eq!(a.wait_snd(), msg.len().div_ceil(a.mss()));

        run(&mut a, &a_wire, &mut b, &b_wire, 0, 1000, |_| true);

        assert_eq!(b.peek_size(), Some(msg.len()));
        let mut buf = vec![0u8; msg.len()];
        assert_eq!(b.recv_into(&mut buf), Ok(msg.len()));
        assert_eq!(buf, msg);
        assert_eq!(b.peek_size(), None);
    }

    #[test]
    fn test_retransmission_after_loss() {
        let (mut a, a_wire, mut b, b_wire) = pair(true);

        for i in 0..10u8 {
            a.send(&[i; 50]).unwrap();
        }

        // every third datagram in the first 300 ms is lost
        let mut counter = 0;
        let now = run(&mut a, &a_wire, &mut b, &b_wire, 0, 300, |_| {
            counter += 1;
            counter % 3 != 0
        });
        run(&mut a, &a_wire, &mut b, &b_wire, now, 5000, |_| true);

        let received = drain_messages(&mut b);
        assert_eq!(received, (0..10u8).map(|i| vec![i; 50]).collect::<Vec<_>>());
        assert!(!a.is_dead());
    }

    #[test]
    fn test_dead_link() {
        let (mut a, a_wire, mut b, b_wire) = pair(true);
        a.set_dead_link(3);
        a.send(b"lost forever").unwrap();

        run(&mut a, &a_wire, &mut b, &b_wire, 0, 300, |_| false);
        assert!(!a.is_dead());

        run(&mut a, &a_wire, &mut b, &b_wire, 300, 2000, |_| false);

        assert!(a.is_dead());
        assert_eq!(b.peek_size(), None);
    }

    #[test]
    fn test_message_too_large() {
        let (mut a, _, _, _) = pair(false);
        let max = a.max_message_size();

        assert_eq!(a.send(&vec![0u8; max]), Ok(()));
        assert_eq!(a.send(&vec![0u8; max + 1]), Err(KcpError::MessageTooLarge));
    }

    #[test]
    fn test_input_conv_mismatch() {
        let (mut a, a_wire, _, _) = pair(true);
        let mut other = Kcp::new(CONV + 1, Wire::default());

        a.send(b"x").unwrap();
        a.update(0);
        a.update(10);
        let packet = a_wire.take().pop().unwrap();

        assert_eq!(other.input(&packet), Err(KcpError::ConvMismatch { expected: CONV + 1, actual: CONV }));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(vec![1, 2, 3])]
    fn test_input_truncated(#[case] data: Vec<u8>) {
        let (mut a, _, _, _) = pair(false);
        assert_eq!(a.input(&data), Err(KcpError::Truncated));
    }

    #[test]
    fn test_recv_empty() {
        let (_, _, mut b, _) = pair(false);
        assert_eq!(b.recv(&mut BytesMut::new()), Err(KcpError::Empty));
    }

    #[test]
    fn test_recv_into_too_small() {
        let (mut a, a_wire, mut b, b_wire) = pair(true);
        a.send(&[7u8; 100]).unwrap();
        run(&mut a, &a_wire, &mut b, &b_wire, 0, 200, |_| true);

        let mut buf = [0u8; 10];
        assert_eq!(b.recv_into(&mut buf), Err(KcpError::BufferTooSmall { required: 100 }));
        assert_eq!(b.peek_size(), Some(100));
    }

    #[test]
    fn test_send_window_limits_in_flight() {
        let (mut a, a_wire, _, _) = pair(true);
        a.set_wndsize(4, 0);
        for _ in 0..10 {
            a.send(b"abc").unwrap();
        }

        a.update(0);
        let sent_segments: usize = a_wire.take().iter()
            .map(|p| {
                let mut buf = p.as_slice();
                let mut count = 0;
                while let Ok(header) = SegmentHeader::deser(&mut buf) {
                    buf.advance(header.len);
                    count += 1;
                }
                count
            })
            .sum();
        assert_eq!(sent_segments, 4);
        assert_eq!(a.wait_snd(), 10);
    }

    #[rstest]
    #[case::too_small(40, false)]
    #[case::minimum(50, true)]
    #[case::regular(1400, true)]
    fn test_set_mtu(#[case] mtu: u32, #[case] ok: bool) {
        let (mut a, _, _, _) = pair(false);
        assert_eq!(a.set_mtu(mtu).is_ok(), ok);
        if ok {
            assert_eq!(a.mss(), mtu as usize - OVERHEAD);
        }
    }

    #[test]
    fn test_set_wndsize_keeps_minimum_receive_window() {
        let (mut a, _, _, _) = pair(false);
        a.set_wndsize(16, 8);
        assert_eq!(a.snd_wnd(), 16);
        assert_eq!(a.rcv_wnd(), WND_RCV);

        a.set_wndsize(0, 512);
        assert_eq!(a.snd_wnd(), 16);
        assert_eq!(a.rcv_wnd(), 512);
    }

    #[test]
    fn test_check() {
        let (mut a, _, _, _) = pair(false);
        assert_eq!(a.check(5), 5);

        a.update(0);
        let next = a.check(1);
        assert!(next > 1 && next <= 1 + a.interval);
    }

    fn hostile(kcp: &Kcp<Wire>, cmd: u8, frg: u8, wnd: u16, ts: u32, sn: u32, una: u32) -> Vec<u8> {
        let seg = Segment {
            conv: kcp.conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data: if cmd == CMD_PUSH { Bytes::from_static(b"x") } else { Bytes::new() },
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        seg.encode(&mut buf);
        buf.to_vec()
    }

    #[rstest]
    #[case::ack_ts_far_past(|k: &Kcp<Wire>| hostile(k, CMD_ACK, 0, 128, k.current.wrapping_sub(0x7FFF_0000), k.snd_nxt, k.snd_una))]
    #[case::ack_ts_max_rtt(|k: &Kcp<Wire>| hostile(k, CMD_ACK, 0, 128, k.current.wrapping_sub(i32::MAX as u32), k.snd_nxt, k.snd_una))]
    #[case::ack_ts_future(|k: &Kcp<Wire>| hostile(k, CMD_ACK, 0, 128, k.current.wrapping_add(5000), k.snd_nxt, k.snd_una))]
    #[case::ack_sn_beyond_snd_nxt(|k: &Kcp<Wire>| hostile(k, CMD_ACK, 0, 128, k.current, k.snd_nxt.wrapping_add(5), k.snd_una))]
    #[case::una_beyond_snd_nxt(|k: &Kcp<Wire>| hostile(k, CMD_WINS, 0, 128, 0, 0, k.snd_nxt.wrapping_add(1000)))]
    #[case::zero_window(|k: &Kcp<Wire>| hostile(k, CMD_WINS, 0, 0, 0, 0, k.snd_una))]
    #[case::window_probe(|k: &Kcp<Wire>| hostile(k, CMD_WASK, 0, 0, 0, 0, k.snd_una))]
    #[case::push_huge_frg(|k: &Kcp<Wire>| hostile(k, CMD_PUSH, u8::MAX, 128, k.current, k.rcv_nxt, k.snd_una))]
    #[case::push_outside_window(|k: &Kcp<Wire>| hostile(k, CMD_PUSH, 0, 128, k.current, k.rcv_nxt.wrapping_add(100_000), k.snd_una))]
    fn test_hostile_segment_keeps_engine_usable(#[case] segment: fn(&Kcp<Wire>) -> Vec<u8>) {
        let (mut a, a_wire, mut b, b_wire) = pair(true);
        a.send(b"first").unwrap();
        let now = run(&mut a, &a_wire, &mut b, &b_wire, 0, 200, |_| true);
        assert_eq!(drain_messages(&mut b), vec![b"first".to_vec()]);

        a.send(b"in flight").unwrap();
        a.update(now);
        let datagram = segment(&a);
        assert_eq!(a.input(&datagram), Ok(()));
        assert!((RTO_NDL..=RTO_MAX).contains(&a.rx_rto()), "rto {}", a.rx_rto());

        a.send(b"after").unwrap();
        run(&mut a, &a_wire, &mut b, &b_wire, now + 10, 3000, |_| true);
        assert_eq!(drain_messages(&mut b), vec![b"in flight".to_vec(), b"after".to_vec()]);
        assert!(!a.is_dead());
    }

    #[test]
    fn test_rtt_sample_out_of_range_is_ignored() {
        let (mut a, a_wire, mut b, b_wire) = pair(false);
        a.send(b"x").unwrap();
        let now = run(&mut a, &a_wire, &mut b, &b_wire, 0, 500, |_| true);
        let rto = a.rx_rto();

        a.update(now);
        let datagram = hostile(&a, CMD_ACK, 0, 128, now.wrapping_sub(0x7FFF_0000), a.snd_nxt, a.snd_una);
        a.input(&datagram).unwrap();
        assert_eq!(a.rx_rto(), rto);
    }

    #[rstest]
    #[case::constant_max(vec![RTO_MAX as i32; 10])]
    #[case::alternating((0..20).map(|i| if i % 2 == 0 { 0 } else { RTO_MAX as i32 }).collect())]
    #[case::zero_then_max(vec![0, 0, 0, RTO_MAX as i32])]
    fn test_update_ack_stays_bounded(#[case] samples: Vec<i32>) {
        let (mut a, _, _, _) = pair(false);
        for rtt in samples {
            a.update_ack(rtt);
            assert!((RTO_MIN..=RTO_MAX).contains(&a.rx_rto()), "rto {}", a.rx_rto());
            assert!(a.rx_srtt >= 1 && a.rx_srtt <= RTO_MAX as i32);
        }
    }

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::later(10, 5, 5)]
    #[case::earlier(5, 10, -5)]
    #[case::wrapped(2, u32::MAX - 1, 4)]
    fn test_timediff(#[case] later: u32, #[case] earlier: u32, #[case] expected: i32) {
        assert_eq!(timediff(later, earlier), expected);
    }
}
