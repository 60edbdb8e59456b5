use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
#[cfg(test)] use mockall::automock;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};
use crate::arq::{Kcp, KcpOutput};
use crate::config::{EndpointConfig, KcpSetting};
use crate::protocol::MTU_SIZE;
use crate::runtime::scheduler::WorkerId;
use crate::runtime::timer::TimerId;
use crate::session::send_buffer::SendBuffer;
use crate::session::send_socket::SendSocket;
use crate::util::address::host_string;
use crate::util::safe_converter::{wrapping_millis, SafeCast};

pub type ReadEventCallback = Arc<dyn Fn(&Arc<KcpSession>, &[u8]) + Send + Sync>;
/// Returning false rejects the connection
pub type ConnectEventCallback = Arc<dyn Fn(&Arc<KcpSession>) -> bool + Send + Sync>;
pub type DisconnectEventCallback = Arc<dyn Fn(&Arc<KcpSession>) + Send + Sync>;

/// Implemented by the endpoint owning a session: it is notified (at most once per session) when
///  the session is closed locally, either gracefully (FIN) or by a reset (RST)
#[cfg_attr(test, automock)]
pub trait SessionCloseHandler: Send + Sync + 'static {
    fn on_session_closed(&self, session: &Arc<KcpSession>, graceful: bool);
}

/// Sends the engine's segments to the session's current peer address
struct SessionOutput {
    socket: Arc<dyn SendSocket>,
    peer_addr: Arc<RwLock<SocketAddr>>,
}
impl KcpOutput for SessionOutput {
    fn output(&mut self, packet: &[u8]) {
        let to = *self.peer_addr.read().unwrap();
        self.socket.do_send_packet(to, packet);
    }
}

struct SessionInner {
    engine: Option<Kcp<SessionOutput>>,
    recv_buf: BytesMut,
    setting: KcpSetting,
}

/// One conversation with a peer: an engine instance bound to the endpoint's socket, a conv and
///  the peer's address.
///
/// Application data passes through a bounded [SendBuffer] and is moved into the engine by the
///  periodic [KcpSession::on_update_timeout]. Received datagrams go through
///  [KcpSession::on_recv], which hands every reassembled message to the read callback. The
///  endpoint runs both on the session's worker, so they never run concurrently.
pub struct KcpSession {
    conv: u32,
    socket: Arc<dyn SendSocket>,
    local_addr: SocketAddr,
    local_host: String,
    peer_addr: Arc<RwLock<SocketAddr>>,
    inner: Mutex<SessionInner>,
    send_buffer: SendBuffer,
    max_segments_per_update: usize,
    worker: OnceLock<WorkerId>,
    update_timer: Mutex<Option<TimerId>>,
    read_callback: RwLock<Option<ReadEventCallback>>,
    close_handler: Mutex<Option<Weak<dyn SessionCloseHandler>>>,
    closed: AtomicBool,
}

impl Debug for KcpSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpSession")
            .field("conv", &format_args!("{:#x}", self.conv))
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl KcpSession {
    /// Creates a session and its engine. If the engine can not be set up for `setting`, the
    ///  session exists without an engine, which callers must check with
    ///  [KcpSession::has_engine].
    pub fn new(setting: KcpSetting, socket: Arc<dyn SendSocket>, peer_addr: SocketAddr, config: &EndpointConfig) -> Arc<KcpSession> {
        let local_addr = socket.local_addr();
        let session = Arc::new(KcpSession {
            conv: setting.conv,
            socket,
            local_addr,
            local_host: host_string(&local_addr),
            peer_addr: Arc::new(RwLock::new(peer_addr)),
            inner: Mutex::new(SessionInner {
                engine: None,
                recv_buf: BytesMut::with_capacity(2 * MTU_SIZE),
                setting,
            }),
            send_buffer: SendBuffer::new(config.send_buffer_capacity),
            max_segments_per_update: config.max_segments_per_update,
            worker: OnceLock::new(),
            update_timer: Mutex::new(None),
            read_callback: RwLock::new(None),
            close_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = session.set_setting(setting) {
            error!("conv {:#x}: failed to set up engine: {}", setting.conv, e);
        }
        else {
            debug!("created session {:?} with {:?}", session, setting);
        }
        session
    }

    /// (Re-)initializes the engine, dropping the previous one with everything it had queued
    pub fn set_setting(&self, setting: KcpSetting) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.engine = None;
        inner.setting = setting;

        if setting.conv != self.conv {
            bail!("setting for conv {:#x} can not be applied to session {:#x}", setting.conv, self.conv);
        }

        let mut engine = Kcp::new(setting.conv, SessionOutput {
            socket: self.socket.clone(),
            peer_addr: self.peer_addr.clone(),
        });
        engine.set_mtu(setting.mtu)?;
        engine.set_wndsize(setting.send_win_size, setting.recv_win_size);
        engine.set_nodelay(setting.nodelay, setting.interval, setting.fast_resend, setting.nocwnd);

        inner.engine = Some(engine);
        Ok(())
    }

    pub fn setting(&self) -> KcpSetting {
        self.inner.lock().unwrap().setting
    }

    pub fn has_engine(&self) -> bool {
        self.inner.lock().unwrap().engine.is_some()
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        *self.peer_addr.read().unwrap()
    }

    pub fn peer_host(&self) -> String {
        host_string(&self.peer_addr())
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_addr().port()
    }

    /// All subsequent output goes to the new address
    pub fn set_peer_addr(&self, peer_addr: SocketAddr) {
        let mut current = self.peer_addr.write().unwrap();
        if *current != peer_addr {
            debug!("conv {:#x}: peer address changed from {:?} to {:?}", self.conv, *current, peer_addr);
            *current = peer_addr;
        }
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.worker.get().copied()
    }

    /// Pins the session to a worker. The binding is fixed for the session's lifetime.
    pub fn bind_worker(&self, worker: WorkerId) {
        if self.worker.set(worker).is_err() {
            warn!("conv {:#x} is already bound to worker {:?}", self.conv, self.worker());
        }
    }

    pub fn set_update_timer(&self, timer: TimerId) {
        *self.update_timer.lock().unwrap() = Some(timer);
    }

    pub fn take_update_timer(&self) -> Option<TimerId> {
        self.update_timer.lock().unwrap().take()
    }

    pub fn has_update_timer(&self) -> bool {
        self.update_timer.lock().unwrap().is_some()
    }

    pub fn set_read_callback(&self, callback: Option<ReadEventCallback>) {
        *self.read_callback.write().unwrap() = callback;
    }

    pub fn set_close_handler(&self, handler: Weak<dyn SessionCloseHandler>) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    /// Bytes accepted by [KcpSession::send] that were not moved into the engine yet
    pub fn pending_send_bytes(&self) -> usize {
        self.send_buffer.num_bytes()
    }

    /// Segments inside the engine that were not sent or not acknowledged yet
    pub fn wait_snd(&self) -> usize {
        self.inner.lock().unwrap().engine.as_ref()
            .map(|engine| engine.wait_snd())
            .unwrap_or(0)
    }

    /// The largest message [KcpSession::send] accepts, 0 without an engine
    pub fn max_message_size(&self) -> usize {
        self.inner.lock().unwrap().engine.as_ref()
            .map(|engine| engine.max_message_size())
            .unwrap_or(0)
    }

    /// Queues a message for sending. Returns false if the message is empty or too large, if the
    ///  send buffer can not take it, or if the session has no engine. A rejected message leaves
    ///  previously queued messages untouched.
    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            debug!("conv {:#x}: rejecting empty message", self.conv);
            return false;
        }
        if self.closed.load(Ordering::Acquire) {
            debug!("conv {:#x}: rejecting message for a closed session", self.conv);
            return false;
        }

        let max_message_size = self.max_message_size();
        if data.len() > max_message_size {
            debug!("conv {:#x}: rejecting message of {} bytes, maximum is {}", self.conv, data.len(), max_message_size);
            return false;
        }

        self.send_buffer.push(Bytes::copy_from_slice(data))
    }

    /// Moves queued messages into the engine and runs the engine's time driven flush.
    ///
    /// At most `max_segments_per_update` MTU worth of data is moved per call. A message is only
    ///  moved if the engine's queued segments plus the message's fragments stay within twice the
    ///  send window, except into an empty engine.
    pub fn on_update_timeout(self: &Arc<Self>, now_millis: u64) {
        let dead = {
            let mut inner = self.inner.lock().unwrap();
            let Some(engine) = inner.engine.as_mut() else {
                return;
            };

            let mss = engine.mss();
            let budget = self.max_segments_per_update * mss;
            let max_waiting: usize = (2 * engine.snd_wnd()).safe_cast();
            let mut moved = 0;
            while moved < budget {
                let Some(len) = self.send_buffer.front_len() else {
                    break;
                };
                let waiting = engine.wait_snd();
                if waiting > 0 && waiting + len.div_ceil(mss).max(1) > max_waiting {
                    break;
                }
                let Some(message) = self.send_buffer.pop() else {
                    break;
                };
                moved += message.len();
                if let Err(e) = engine.send(&message) {
                    warn!("conv {:#x}: dropping message of {} bytes: {}", self.conv, message.len(), e);
                }
            }
            if moved > 0 {
                trace!("conv {:#x}: moved {} bytes into the engine", self.conv, moved);
            }

            engine.update(wrapping_millis(now_millis));
            engine.is_dead()
        };

        if dead && !self.closed.load(Ordering::Acquire) {
            warn!("conv {:#x}: link to {:?} is dead, resetting", self.conv, self.peer_addr());
            self.reset_context();
        }
    }

    /// Feeds a datagram to the engine and passes every message it completes to the read
    ///  callback. Returns false if the engine rejected the datagram.
    pub fn on_recv(self: &Arc<Self>, datagram: &[u8]) -> bool {
        let messages = {
            let mut inner = self.inner.lock().unwrap();
            let SessionInner { engine, recv_buf, .. } = &mut *inner;
            let Some(engine) = engine.as_mut() else {
                debug!("conv {:#x}: no engine, dropping datagram", self.conv);
                return false;
            };

            if let Err(e) = engine.input(datagram) {
                debug!("conv {:#x}: engine rejected datagram of {} bytes: {}", self.conv, datagram.len(), e);
                return false;
            }

            let mut messages: Vec<Bytes> = Vec::new();
            while engine.peek_size().is_some() {
                recv_buf.clear();
                match engine.recv(recv_buf) {
                    Ok(_) => messages.push(recv_buf.split().freeze()),
                    Err(e) => {
                        warn!("conv {:#x}: failed to receive message: {}", self.conv, e);
                        break;
                    }
                }
            }
            messages
        };

        if messages.is_empty() {
            return true;
        }

        let callback = self.read_callback.read().unwrap().clone();
        match callback {
            Some(callback) => {
                for message in &messages {
                    callback(self, message);
                }
            }
            None => debug!("conv {:#x}: no read callback, dropping {} messages", self.conv, messages.len()),
        }
        true
    }

    /// Closes the session gracefully: the owning endpoint sends FIN and tears the session down
    ///  when the peer acknowledges it. Subsequent calls have no effect.
    pub fn close_context(self: &Arc<Self>) {
        self.notify_closed(true);
    }

    /// Resets the session: the owning endpoint sends RST and tears it down immediately
    pub fn reset_context(self: &Arc<Self>) {
        self.notify_closed(false);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn notify_closed(self: &Arc<Self>, graceful: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("conv {:#x} is already closed", self.conv);
            return;
        }

        let handler = self.close_handler.lock().unwrap()
            .take()
            .and_then(|handler| handler.upgrade());
        match handler {
            Some(handler) => handler.on_session_closed(self, graceful),
            None => debug!("conv {:#x}: closed without a live endpoint", self.conv),
        }
    }

    /// Drops the engine and all queued data. Called by the endpoint at teardown, after the update
    ///  timer was cancelled.
    pub fn release(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_handler.lock().unwrap().take();
        self.inner.lock().unwrap().engine = None;
        self.send_buffer.clear();
        trace!("conv {:#x}: released", self.conv);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use mockall::predicate::eq;
    use rstest::rstest;
    use bytes::BufMut;
    use crate::arq::{CMD_ACK, CMD_WINS};
    use crate::config::KcpMode;
    use crate::session::send_socket::MockSendSocket;
    use super::*;

    const CONV: u32 = 0x4B435001;

    type Captured = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    fn capturing_socket(local: &str) -> (Arc<dyn SendSocket>, Captured) {
        let captured: Captured = Default::default();
        let mut socket = MockSendSocket::new();
        socket.expect_local_addr()
            .return_const(local.parse::<SocketAddr>().unwrap());
        let c = captured.clone();
        socket.expect_do_send_packet()
            .returning(move |to, buf| c.lock().unwrap().push((to, buf.to_vec())));
        (Arc::new(socket), captured)
    }

    struct Peer {
        session: Arc<KcpSession>,
        sent: Captured,
        received: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn peer(local: &str, remote: &str, mode: KcpMode, config: &EndpointConfig) -> Peer {
        let (socket, sent) = capturing_socket(local);
        let setting = KcpSetting::for_mode(CONV, mode, 0, 0);
        let session = KcpSession::new(setting, socket, remote.parse().unwrap(), config);

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Default::default();
        let r = received.clone();
        session.set_read_callback(Some(Arc::new(move |s: &Arc<KcpSession>, data: &[u8]| {
            assert_eq!(s.conv(), CONV);
            r.lock().unwrap().push(data.to_vec());
        })));
        Peer { session, sent, received }
    }

    fn connected_pair(mode: KcpMode, config: &EndpointConfig) -> (Peer, Peer) {
        (
            peer("127.0.0.1:1000", "127.0.0.1:2000", mode, config),
            peer("127.0.0.1:2000", "127.0.0.1:1000", mode, config),
        )
    }

    fn transfer(from: &Peer, to: &Peer) {
        let packets = std::mem::take(&mut *from.sent.lock().unwrap());
        for (addr, packet) in packets {
            assert_eq!(addr, to.session.local_addr());
            assert!(to.session.on_recv(&packet));
        }
    }

    fn run(a: &Peer, b: &Peer, start: u64, duration: u64) {
        let mut now = start;
        while now < start + duration {
            a.session.on_update_timeout(now);
            b.session.on_update_timeout(now);
            transfer(a, b);
            transfer(b, a);
            now += 10;
        }
    }

    #[rstest]
    #[case::normal(KcpMode::Normal)]
    #[case::fast(KcpMode::Fast)]
    #[case::fast3(KcpMode::Fast3)]
    fn test_messages_delivered_in_order(#[case] mode: KcpMode) {
        let config = EndpointConfig::default();
        let (a, b) = connected_pair(mode, &config);

        let messages = (0..50u32)
            .map(|i| format!("message {}", i).into_bytes())
            .collect::<Vec<_>>();
        for msg in &messages {
            assert!(a.session.send(msg));
        }

        run(&a, &b, 0, 10_000);

        assert_eq!(*b.received.lock().unwrap(), messages);
        assert_eq!(a.session.pending_send_bytes(), 0);
        assert_eq!(a.session.wait_snd(), 0);
    }

    #[test]
    fn test_large_message_is_reassembled() {
        let config = EndpointConfig::default();
        let (a, b) = connected_pair(KcpMode::Fast2, &config);

        let msg = (0..50_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        assert!(a.session.send(&msg));
        run(&a, &b, 0, 5_000);

        assert_eq!(*b.received.lock().unwrap(), vec![msg]);
    }

    #[test]
    fn test_send_rejections() {
        let config = EndpointConfig { send_buffer_capacity: 10_000, ..Default::default() };
        let (a, _) = connected_pair(KcpMode::Normal, &config);

        assert!(!a.session.send(b""));
        assert!(!a.session.send(&vec![0u8; a.session.max_message_size() + 1]));

        assert!(a.session.send(&[1u8; 6000]));
        assert!(!a.session.send(&[2u8; 6000]));
        assert_eq!(a.session.pending_send_bytes(), 6000);
        assert!(a.session.send(&[3u8; 4000]));
        assert_eq!(a.session.pending_send_bytes(), 10_000);
    }

    #[test]
    fn test_backpressure_keeps_data_intact() {
        let config = EndpointConfig { send_buffer_capacity: 20_000, ..Default::default() };
        let (a, b) = connected_pair(KcpMode::Fast3, &config);

        let mut accepted = Vec::new();
        let mut i = 0u32;
        loop {
            let msg = vec![(i % 256) as u8; 1000];
            if !a.session.send(&msg) {
                break;
            }
            accepted.push(msg);
            i += 1;
        }
        assert_eq!(accepted.len(), 20);

        run(&a, &b, 0, 5_000);
        assert_eq!(*b.received.lock().unwrap(), accepted);
    }

    #[test]
    fn test_update_moves_limited_by_send_window() {
        let config = EndpointConfig::default();
        let (socket, _) = capturing_socket("127.0.0.1:1000");
        let mut setting = KcpSetting::for_mode(CONV, KcpMode::Fast3, 4, 0);
        setting.send_win_size = 4;
        let session = KcpSession::new(setting, socket, "127.0.0.1:2000".parse().unwrap(), &config);

        for _ in 0..20 {
            assert!(session.send(b"x"));
        }
        session.on_update_timeout(0);

        assert_eq!(session.wait_snd(), 8);
        assert_eq!(session.pending_send_bytes(), 12);
    }

    #[test]
    fn test_update_counts_fragments_against_send_window() {
        let config = EndpointConfig { send_buffer_capacity: 100_000, max_segments_per_update: 100, ..Default::default() };
        let (socket, _) = capturing_socket("127.0.0.1:1000");
        let mut setting = KcpSetting::for_mode(CONV, KcpMode::Fast3, 4, 0);
        setting.send_win_size = 4;
        let session = KcpSession::new(setting, socket, "127.0.0.1:2000".parse().unwrap(), &config);

        let mss = session.inner.lock().unwrap().engine.as_ref().unwrap().mss();
        for i in 0..3u8 {
            assert!(session.send(&vec![i; 5 * mss]));
        }
        session.on_update_timeout(0);

        assert_eq!(session.wait_snd(), 5);
        assert_eq!(session.pending_send_bytes(), 10 * mss);
    }

    fn control_segment(cmd: u8, wnd: u16, ts: u32, sn: u32, una: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(CONV);
        buf.put_u8(cmd);
        buf.put_u8(0);
        buf.put_u16_le(wnd);
        buf.put_u32_le(ts);
        buf.put_u32_le(sn);
        buf.put_u32_le(una);
        buf.put_u32_le(0);
        buf.to_vec()
    }

    #[rstest]
    #[case::ack_ts_far_past(control_segment(CMD_ACK, 128, 490u32.wrapping_sub(0x7FFF_0000), 1, 1))]
    #[case::ack_ts_future(control_segment(CMD_ACK, 128, 490 + 5000, 1, 1))]
    #[case::una_beyond_snd_nxt(control_segment(CMD_WINS, 128, 0, 0, 1000))]
    #[case::zero_window(control_segment(CMD_WINS, 0, 0, 0, 1))]
    fn test_hostile_segment_keeps_session_usable(#[case] datagram: Vec<u8>) {
        let config = EndpointConfig::default();
        let (a, b) = connected_pair(KcpMode::Fast, &config);

        assert!(a.session.send(b"before"));
        run(&a, &b, 0, 500);
        assert!(a.session.on_recv(&datagram));

        assert!(a.session.has_engine());
        assert!(a.session.send(b"after"));
        run(&a, &b, 500, 10_000);

        assert_eq!(*b.received.lock().unwrap(), vec![b"before".to_vec(), b"after".to_vec()]);
        assert!(!a.session.is_closed());
    }

    #[test]
    fn test_on_recv_rejects_garbage() {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Normal, &config);

        assert!(!a.session.on_recv(&[1, 2, 3]));
        let mut other_conv = vec![0u8; 24];
        other_conv[..4].copy_from_slice(&(CONV + 1).to_le_bytes());
        assert!(!a.session.on_recv(&other_conv));
        assert!(a.received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_peer_addr_change_redirects_output() {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Fast3, &config);
        let new_peer: SocketAddr = "127.0.0.1:3000".parse().unwrap();

        a.session.set_peer_addr(new_peer);
        assert!(a.session.send(b"hello"));
        a.session.on_update_timeout(0);

        let sent = a.sent.lock().unwrap();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|(to, _)| *to == new_peer));
        assert_eq!(a.session.peer_port(), 3000);
        assert_eq!(a.session.peer_host(), "127.0.0.1");
    }

    #[rstest]
    #[case::close(true)]
    #[case::reset(false)]
    fn test_close_handler_notified_once(#[case] graceful: bool) {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Normal, &config);

        let mut handler = MockSessionCloseHandler::new();
        handler.expect_on_session_closed()
            .withf(move |session, g| session.conv() == CONV && *g == graceful)
            .times(1)
            .return_const(());
        let handler: Arc<dyn SessionCloseHandler> = Arc::new(handler);
        a.session.set_close_handler(Arc::downgrade(&handler));

        if graceful {
            a.session.close_context();
            a.session.close_context();
            a.session.reset_context();
        }
        else {
            a.session.reset_context();
            a.session.close_context();
        }
        assert!(a.session.is_closed());
        assert!(!a.session.send(b"after close"));
    }

    #[test]
    fn test_dead_link_resets() {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Fast3, &config);

        let mut handler = MockSessionCloseHandler::new();
        handler.expect_on_session_closed()
            .with(mockall::predicate::always(), eq(false))
            .times(1)
            .return_const(());
        let handler: Arc<dyn SessionCloseHandler> = Arc::new(handler);
        a.session.set_close_handler(Arc::downgrade(&handler));

        assert!(a.session.send(b"nobody is listening"));
        // packets are never delivered
        for step in 0..2_000u64 {
            a.session.on_update_timeout(step * 1000);
        }
        assert!(a.session.is_closed());
    }

    #[test]
    fn test_release() {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Normal, &config);
        assert!(a.session.send(b"abc"));

        a.session.release();
        assert!(!a.session.has_engine());
        assert_eq!(a.session.pending_send_bytes(), 0);
        assert!(!a.session.send(b"abc"));
        assert!(!a.session.on_recv(&[0u8; 24]));

        // updating a released session is a no-op
        a.session.on_update_timeout(100);
        assert!(a.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_setting_leaves_no_engine() {
        let config = EndpointConfig::default();
        let (socket, _) = capturing_socket("127.0.0.1:1000");
        let mut setting = KcpSetting::for_mode(CONV, KcpMode::Normal, 0, 0);
        setting.mtu = 10;

        let session = KcpSession::new(setting, socket, "127.0.0.1:2000".parse().unwrap(), &config);
        assert!(!session.has_engine());
        assert!(!session.send(b"abc"));
    }

    #[test]
    fn test_worker_binding_is_fixed() {
        let config = EndpointConfig::default();
        let (a, _) = connected_pair(KcpMode::Normal, &config);
        assert_eq!(a.session.worker(), None);

        a.session.bind_worker(WorkerId::new(2));
        a.session.bind_worker(WorkerId::new(0));
        assert_eq!(a.session.worker(), Some(WorkerId::new(2)));
    }
}
