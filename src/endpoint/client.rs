use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, span, trace, warn, Level};
use crate::config::{EndpointConfig, KcpMode, KcpSetting};
use crate::endpoint::{parse_inbound, start_update_timer, Attachment, Endpoint, Inbound, KcpSocket};
use crate::protocol::{ControlHeader, SynCommand};
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scheduler::WorkerId;
use crate::runtime::timer::TimerId;
use crate::session::kcp_session::{DisconnectEventCallback, KcpSession, ReadEventCallback, SessionCloseHandler};
use crate::util::address::resolve_ipv4;

const REPLY_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    /// FIN sent, waiting for the server's ACK
    Disconnecting,
    Closed,
}

struct ClientInner {
    state: ClientState,
    session: Option<Arc<KcpSession>>,
    /// sn and timer of a pending FIN
    fin: Option<(u32, Option<TimerId>)>,
}

/// The connecting side: one session with one server over its own UDP socket.
///
/// [KcpClient::connect] performs the handshake synchronously, before the client is added to a
///  [crate::manager::ConnectionManager]. Once added, received datagrams and the session's
///  update timer are processed on the client's worker.
pub struct KcpClient {
    me: Weak<KcpClient>,
    socket: KcpSocket,
    inner: Mutex<ClientInner>,
    send_win_size: AtomicU32,
    recv_win_size: AtomicU32,
    read_callback: RwLock<Option<ReadEventCallback>>,
    disconnect_callback: RwLock<Option<DisconnectEventCallback>>,
}

impl KcpClient {
    pub fn bind(ip: &str, port: u16, config: EndpointConfig) -> anyhow::Result<Arc<KcpClient>> {
        let socket = KcpSocket::bind(ip, port, config)?;
        Ok(Arc::new_cyclic(|me| KcpClient {
            me: me.clone(),
            send_win_size: AtomicU32::new(socket.config().send_win_size),
            recv_win_size: AtomicU32::new(socket.config().recv_win_size),
            socket,
            inner: Mutex::new(ClientInner {
                state: ClientState::Idle,
                session: None,
                fin: None,
            }),
            read_callback: Default::default(),
            disconnect_callback: Default::default(),
        }))
    }

    /// Window sizes requested by the next [KcpClient::connect]. A value of 0 keeps the current
    ///  setting.
    pub fn set_window_size(&self, send_win_size: u32, recv_win_size: u32) {
        if send_win_size != 0 {
            self.send_win_size.store(send_win_size, Ordering::Release);
        }
        if recv_win_size != 0 {
            self.recv_win_size.store(recv_win_size, Ordering::Release);
        }
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.send_win_size.load(Ordering::Acquire), self.recv_win_size.load(Ordering::Acquire))
    }

    /// Installed on sessions created by subsequent connects
    pub fn set_read_callback(&self, callback: impl Fn(&Arc<KcpSession>, &[u8]) + Send + Sync + 'static) {
        self.read_callback.write().unwrap().replace(Arc::new(callback));
    }

    pub fn set_disconnect_callback(&self, callback: impl Fn(&Arc<KcpSession>) + Send + Sync + 'static) {
        self.disconnect_callback.write().unwrap().replace(Arc::new(callback));
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    pub fn session(&self) -> Option<Arc<KcpSession>> {
        self.inner.lock().unwrap().session.clone()
    }

    /// Sends a SYN to `host:port` and waits up to `timeout` for the server's ACK. The single
    ///  datagram received first decides: anything but an ACK echoing the SYN's sn fails the
    ///  connect.
    ///
    /// This blocks the calling thread, and it must be called before the client is added to a
    ///  manager since the manager owns the socket's read side afterwards.
    pub fn connect(&self, host: &str, port: u16, mode: KcpMode, timeout: Duration) -> anyhow::Result<Arc<KcpSession>> {
        if self.socket.is_attached() {
            bail!("client {:?} must connect before it is attached to a runtime", self.socket.local_addr());
        }
        if self.socket.is_closed() {
            bail!("client {:?} is closed", self.socket.local_addr());
        }
        let server_addr = resolve_ipv4(host, port)?;

        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::Connected => {
                    if let Some(session) = &inner.session {
                        return Ok(session.clone());
                    }
                }
                ClientState::Connecting | ClientState::Disconnecting => {
                    bail!("client {:?} is busy: {:?}", self.socket.local_addr(), inner.state);
                }
                ClientState::Idle | ClientState::Closed => {}
            }
            inner.state = ClientState::Connecting;
        }

        let result = self.do_connect(server_addr, mode, timeout);

        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(session) => {
                inner.state = ClientState::Connected;
                inner.session = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                inner.state = ClientState::Idle;
                Err(e)
            }
        }
    }

    fn do_connect(&self, server_addr: SocketAddr, mode: KcpMode, timeout: Duration) -> anyhow::Result<Arc<KcpSession>> {
        let (send_win_size, recv_win_size) = self.window_size();
        let sn: u32 = rand::random();
        let syn = ControlHeader::new(0, mode, SynCommand::Syn, sn, send_win_size, recv_win_size);

        debug!("connecting to {:?} in mode {:?} with sn {}", server_addr, mode, sn);
        self.socket.send_control(server_addr, &syn);

        let (reply, from) = self.await_reply(server_addr, Instant::now() + timeout)?;
        if reply.command != SynCommand::Ack {
            bail!("connection to {:?} refused: {:?} for conv {:#x}", server_addr, reply.command, reply.conv);
        }
        if reply.sn != sn {
            bail!("handshake with {:?} failed: reply for sn {}, expected {}", server_addr, reply.sn, sn);
        }

        let setting = KcpSetting::for_mode(reply.conv, mode, reply.send_win_size, reply.recv_win_size);
        let session = KcpSession::new(setting, self.socket.send_socket(), from, self.socket.config());
        if !session.has_engine() {
            bail!("no engine for conv {:#x}", reply.conv);
        }
        session.set_read_callback(self.read_callback.read().unwrap().clone());
        let close_handler: Weak<dyn SessionCloseHandler> = self.me.clone();
        session.set_close_handler(close_handler);

        info!("connected to {:?} with conv {:#x}", from, reply.conv);
        Ok(session)
    }

    /// Waits for the first datagram on the socket, using a temporary poll instance
    fn await_reply(&self, server_addr: SocketAddr, deadline: Instant) -> anyhow::Result<(ControlHeader, SocketAddr)> {
        let mut poll = Poll::new()?;
        let fd = self.socket.raw_fd();
        poll.registry().register(&mut SourceFd(&fd), REPLY_TOKEN, Interest::READABLE)?;

        let result = self.poll_reply(&mut poll, server_addr, deadline);
        if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("error deregistering from temporary poll: {}", e);
        }
        result
    }

    fn poll_reply(&self, poll: &mut Poll, server_addr: SocketAddr, deadline: Instant) -> anyhow::Result<(ControlHeader, SocketAddr)> {
        let mut events = Events::with_capacity(4);
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.udp_socket().recv_from(&mut buf) {
                Ok((len, from)) => {
                    if len != ControlHeader::SERIALIZED_LEN {
                        bail!("invalid handshake reply from {:?}: {} bytes", from, len);
                    }
                    let reply = ControlHeader::deser(&mut &buf[..len])
                        .map_err(|e| anyhow!("invalid handshake reply from {:?}: {}", from, e))?;
                    return Ok((reply, from));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                bail!("no reply from {:?} - connect timed out", server_addr);
            };
            match poll.poll(&mut events, Some(remaining)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_datagram(&self, session: &Arc<KcpSession>, from: SocketAddr, datagram: &[u8]) {
        if from != session.peer_addr() {
            debug!("dropping datagram from {:?}: not the connected server {:?}", from, session.peer_addr());
            return;
        }

        match parse_inbound(from, datagram) {
            Some(Inbound::Control(header)) => self.on_control(session, from, header),
            Some(Inbound::Data { conv }) if conv == session.conv() => {
                session.on_recv(datagram);
            }
            Some(Inbound::Data { conv }) => {
                trace!("dropping data for conv {:#x}, connected as {:#x}", conv, session.conv());
            }
            None => {}
        }
    }

    fn on_control(&self, session: &Arc<KcpSession>, from: SocketAddr, header: ControlHeader) {
        debug!("received {:?} from {:?}: conv {:#x}, sn {}", header.command, from, header.conv, header.sn);
        match header.command {
            SynCommand::Ack => {
                let matches_fin = matches!(self.inner.lock().unwrap().fin, Some((sn, _)) if sn == header.sn);
                if matches_fin {
                    debug!("FIN acknowledged by {:?}", from);
                    self.finish();
                }
            }
            SynCommand::Fin if header.conv == session.conv() => {
                self.socket.send_control(from, &header.reply(header.conv, SynCommand::Ack));
                if let Some(attachment) = self.socket.attachment() {
                    session.on_update_timeout(attachment.runtime.now_millis());
                }
                info!("conv {:#x}: closed by {:?}", header.conv, from);
                self.finish();
            }
            SynCommand::Rst if header.conv == session.conv() => {
                info!("conv {:#x}: reset by {:?}", header.conv, from);
                self.finish();
            }
            _ => debug!("ignoring {:?} for conv {:#x}", header.command, header.conv),
        }
    }

    /// Registers the update timer once the client runs on its worker
    fn ensure_update_timer(&self, runtime: &RuntimeHandle, worker: WorkerId, session: &Arc<KcpSession>) {
        if session.has_update_timer() || session.is_closed() {
            return;
        }
        session.bind_worker(worker);
        start_update_timer(runtime, session);
        session.on_update_timeout(runtime.now_millis());
    }

    fn on_disconnect_timeout(&self, sn: u32) {
        let pending = matches!(self.inner.lock().unwrap().fin, Some((fin_sn, _)) if fin_sn == sn);
        if pending {
            warn!("FIN not acknowledged within the disconnect timeout - closing anyway");
            self.finish();
        }
    }

    /// Ends the session: cancels its timers, notifies the application and releases the engine
    fn finish(&self) {
        let (session, fin) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(session) = inner.session.take() else {
                return;
            };
            inner.state = ClientState::Closed;
            (session, inner.fin.take())
        };

        if let Some(Attachment { runtime, .. }) = self.socket.attachment() {
            if let Some((_, Some(timer))) = fin {
                runtime.del_timer(timer);
            }
            if let Some(timer) = session.take_update_timer() {
                runtime.del_timer(timer);
            }
        }

        let disconnect_callback = self.disconnect_callback.read().unwrap().clone();
        if let Some(callback) = disconnect_callback {
            callback(&session);
        }
        session.release();
    }

    fn control_header(session: &KcpSession, command: SynCommand, sn: u32) -> ControlHeader {
        let setting = session.setting();
        ControlHeader::new(session.conv(), setting.mode, command, sn, setting.send_win_size, setting.recv_win_size)
    }
}

impl SessionCloseHandler for KcpClient {
    fn on_session_closed(&self, session: &Arc<KcpSession>, graceful: bool) {
        let sn: u32 = rand::random();
        let peer_addr = session.peer_addr();

        if !graceful {
            info!("conv {:#x}: resetting connection to {:?}", session.conv(), peer_addr);
            self.socket.send_control(peer_addr, &Self::control_header(session, SynCommand::Rst, sn));
            self.finish();
            return;
        }

        info!("conv {:#x}: closing connection to {:?} with FIN sn {}", session.conv(), peer_addr, sn);
        let Some(Attachment { runtime, worker }) = self.socket.attachment() else {
            self.socket.send_control(peer_addr, &Self::control_header(session, SynCommand::Fin, sn));
            self.finish();
            return;
        };

        let me = self.me.clone();
        let timer = runtime.add_timer(self.socket.disconnect_timeout().as_millis() as u64, false, Some(worker), move || {
            if let Some(client) = me.upgrade() {
                client.on_disconnect_timeout(sn);
            }
        });
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ClientState::Disconnecting;
            inner.fin = Some((sn, Some(timer)));
        }
        self.socket.send_control(peer_addr, &Self::control_header(session, SynCommand::Fin, sn));
    }
}

impl Endpoint for KcpClient {
    fn socket(&self) -> &KcpSocket {
        &self.socket
    }

    fn attach(self: Arc<Self>, runtime: RuntimeHandle, worker: WorkerId) -> anyhow::Result<()> {
        self.socket.attach(runtime, worker)
    }

    fn detach(&self) {
        let (state, session) = {
            let inner = self.inner.lock().unwrap();
            (inner.state, inner.session.clone())
        };
        match (state, session) {
            (ClientState::Connected, Some(session)) => session.reset_context(),
            (ClientState::Disconnecting, Some(_)) => self.finish(),
            _ => {}
        }
        self.socket.detach();
    }

    fn on_read_event(self: Arc<Self>) {
        let span = span!(Level::TRACE, "client_read", local_addr = ?self.socket.local_addr());
        let _entered = span.enter();

        let Some(Attachment { runtime, worker }) = self.socket.attachment() else {
            return;
        };
        let Some(session) = self.session() else {
            // the socket is drained anyway so that stray datagrams do not pile up
            let num_dropped = self.socket.recv_datagrams(|from, _| trace!("no session - dropping datagram from {:?}", from));
            trace!("dropped {} datagrams", num_dropped);
            return;
        };

        self.ensure_update_timer(&runtime, worker, &session);
        let num_received = self.socket.recv_datagrams(|from, datagram| self.on_datagram(&session, from, datagram));
        trace!("processed {} datagrams", num_received);
    }
}

impl Drop for KcpClient {
    fn drop(&mut self) {
        if !self.socket.config().auto_close {
            return;
        }

        let attachment = self.socket.detach();
        let Ok(inner) = self.inner.get_mut() else {
            return;
        };
        if let Some(session) = inner.session.take() {
            debug!("conv {:#x}: resetting on shutdown", session.conv());
            self.socket.send_control(session.peer_addr(), &Self::control_header(&session, SynCommand::Rst, rand::random()));
            if let (Some(Attachment { runtime, .. }), Some(timer)) = (&attachment, session.take_update_timer()) {
                runtime.del_timer(timer);
            }
            session.release();
        }
    }
}
