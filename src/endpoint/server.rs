use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, span, trace, warn, Level};
use crate::config::{EndpointConfig, KcpSetting};
use crate::endpoint::conv_allocator::ConvAllocator;
use crate::endpoint::{parse_inbound, start_update_timer, unbind_session, Attachment, Endpoint, Inbound, KcpSocket};
use crate::protocol::{ControlHeader, SynCommand, KCP_FLAG};
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scheduler::WorkerId;
use crate::runtime::timer::TimerId;
use crate::session::kcp_session::{ConnectEventCallback, DisconnectEventCallback, KcpSession, ReadEventCallback, SessionCloseHandler};

/// SYN answered, waiting for the peer's first data packet
struct HalfOpen {
    peer_addr: SocketAddr,
    timer: TimerId,
    /// the ACK that was sent, i.e. the session's parameters
    header: ControlHeader,
}

/// FIN sent, waiting for the peer's ACK
struct HalfClosed {
    conv: u32,
    peer_addr: SocketAddr,
    sn: u32,
    timer: Option<TimerId>,
}

#[derive(Default)]
struct ServerState {
    convs: ConvAllocator,
    half_open: FxHashMap<u32, HalfOpen>,
    half_closed: Vec<HalfClosed>,
    sessions: FxHashMap<u32, Arc<KcpSession>>,
}

#[derive(Default)]
struct ServerCallbacks {
    connect: Option<ConnectEventCallback>,
    read: Option<ReadEventCallback>,
    disconnect: Option<DisconnectEventCallback>,
}

/// Accepts sessions from any number of peers on one UDP socket.
///
/// A SYN allocates a conv and is answered with an ACK, which leaves the conversation half
///  open. The peer's first data packet for that conv establishes the session, subject to the
///  connect callback. FIN / ACK close a session gracefully, RST resets it.
///
/// All handshake processing runs in the server's read handler on the server's worker. Each
///  session is pinned to its own (least loaded) worker, where its received datagrams and its
///  update timer are processed.
pub struct KcpServer {
    me: Weak<KcpServer>,
    socket: KcpSocket,
    state: Mutex<ServerState>,
    callbacks: RwLock<ServerCallbacks>,
}

impl KcpServer {
    pub fn bind(ip: &str, port: u16, config: EndpointConfig) -> anyhow::Result<Arc<KcpServer>> {
        let socket = KcpSocket::bind(ip, port, config)?;
        Ok(Arc::new_cyclic(|me| KcpServer {
            me: me.clone(),
            socket,
            state: Default::default(),
            callbacks: Default::default(),
        }))
    }

    /// Called for every new session before it is added. Returning false rejects the session.
    ///  Without a connect callback, all sessions are accepted.
    pub fn set_connect_callback(&self, callback: impl Fn(&Arc<KcpSession>) -> bool + Send + Sync + 'static) {
        self.callbacks.write().unwrap().connect = Some(Arc::new(callback));
    }

    /// Installed on sessions established afterwards
    pub fn set_read_callback(&self, callback: impl Fn(&Arc<KcpSession>, &[u8]) + Send + Sync + 'static) {
        self.callbacks.write().unwrap().read = Some(Arc::new(callback));
    }

    pub fn set_disconnect_callback(&self, callback: impl Fn(&Arc<KcpSession>) + Send + Sync + 'static) {
        self.callbacks.write().unwrap().disconnect = Some(Arc::new(callback));
    }

    pub fn session(&self, conv: u32) -> Option<Arc<KcpSession>> {
        self.state.lock().unwrap().sessions.get(&conv).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<KcpSession>> {
        self.state.lock().unwrap().sessions.values().cloned().collect()
    }

    pub fn num_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn num_half_open(&self) -> usize {
        self.state.lock().unwrap().half_open.len()
    }

    pub fn num_half_closed(&self) -> usize {
        self.state.lock().unwrap().half_closed.len()
    }

    pub fn is_conv_allocated(&self, conv: u32) -> bool {
        self.state.lock().unwrap().convs.is_allocated(conv)
    }

    /// Resets every live session: each peer gets an RST, and the session is torn down
    pub fn reset_all(&self) {
        for session in self.sessions() {
            if session.is_closed() {
                // waiting for the ACK of a FIN
                self.on_session_closed(&session, false);
            }
            else {
                session.reset_context();
            }
        }
    }

    pub(crate) fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        match parse_inbound(from, datagram) {
            Some(Inbound::Control(header)) => self.on_control(from, header),
            Some(Inbound::Data { conv }) => self.on_data(from, conv, datagram),
            None => {}
        }
    }

    fn on_control(&self, from: SocketAddr, header: ControlHeader) {
        debug!("received {:?} from {:?}: conv {:#x}, sn {}", header.command, from, header.conv, header.sn);
        match header.command {
            SynCommand::Syn => self.on_syn(from, header),
            SynCommand::Ack => self.on_ack(from, header),
            SynCommand::Fin => self.on_fin(from, header),
            SynCommand::Rst => self.on_rst(from, header),
        }
    }

    fn on_syn(&self, from: SocketAddr, header: ControlHeader) {
        let Some(Attachment { runtime, worker }) = self.socket.attachment() else {
            warn!("received SYN from {:?} on a detached endpoint - dropping", from);
            return;
        };

        let reply = {
            let mut state = self.state.lock().unwrap();
            let duplicate = state.half_open.iter()
                .find(|(_, half_open)| half_open.peer_addr == from && half_open.header.sn == header.sn)
                .map(|(conv, _)| *conv);

            if let Some(conv) = duplicate {
                debug!("duplicate SYN from {:?} - repeating ACK for conv {:#x}", from, conv);
                header.reply(conv, SynCommand::Ack)
            }
            else if let Some(conv) = state.convs.allocate() {
                let reply = header.reply(conv, SynCommand::Ack);
                let me = self.me.clone();
                let timer = runtime.add_timer(self.socket.connect_timeout().as_millis() as u64, false, Some(worker), move || {
                    if let Some(server) = me.upgrade() {
                        server.on_connect_timeout(conv);
                    }
                });
                state.half_open.insert(conv, HalfOpen {
                    peer_addr: from,
                    timer,
                    header: reply,
                });
                info!("SYN from {:?}: assigned conv {:#x}", from, conv);
                reply
            }
            else {
                warn!("SYN from {:?}: no conv available - rejecting", from);
                header.reply(KCP_FLAG, SynCommand::Fin)
            }
        };
        self.socket.send_control(from, &reply);
    }

    fn on_connect_timeout(&self, conv: u32) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            let expired = state.half_open.remove(&conv);
            if expired.is_some() {
                state.convs.release(conv);
            }
            expired
        };

        if let Some(half_open) = expired {
            info!("conv {:#x}: no data from {:?} within the connect timeout - releasing", conv, half_open.peer_addr);
            self.socket.send_control(half_open.peer_addr, &half_open.header.reply(conv, SynCommand::Rst));
        }
    }

    fn on_data(&self, from: SocketAddr, conv: u32, datagram: &[u8]) {
        let Some(Attachment { runtime, .. }) = self.socket.attachment() else {
            return;
        };

        let established = self.state.lock().unwrap().sessions.get(&conv).cloned();
        let session = match established {
            Some(session) => session,
            None => {
                let half_open = self.state.lock().unwrap().half_open.remove(&conv);
                let Some(half_open) = half_open else {
                    trace!("no session for conv {:#x} from {:?} - dropping", conv, from);
                    return;
                };
                match self.establish(&runtime, from, conv, half_open) {
                    Some(session) => session,
                    None => return,
                }
            }
        };

        let data = Bytes::copy_from_slice(datagram);
        runtime.schedule(session.worker(), move || {
            // the peer's address may change mid-session, e.g. with NAT rebinding
            if session.on_recv(&data) {
                session.set_peer_addr(from);
            }
        });
    }

    fn establish(&self, runtime: &RuntimeHandle, from: SocketAddr, conv: u32, half_open: HalfOpen) -> Option<Arc<KcpSession>> {
        runtime.del_timer(half_open.timer);

        let header = half_open.header;
        let setting = KcpSetting::for_mode(conv, header.mode, header.send_win_size, header.recv_win_size);
        let session = KcpSession::new(setting, self.socket.send_socket(), from, self.socket.config());
        if !session.has_engine() {
            warn!("conv {:#x}: no engine for {:?} - dropping the connection", conv, from);
            self.release_conv(conv);
            return None;
        }

        let worker = runtime.assign_worker();
        session.bind_worker(worker);

        let (connect_callback, read_callback) = {
            let callbacks = self.callbacks.read().unwrap();
            (callbacks.connect.clone(), callbacks.read.clone())
        };
        session.set_read_callback(read_callback);

        let accepted = connect_callback
            .map(|callback| callback(&session))
            .unwrap_or(true);
        if !accepted {
            info!("conv {:#x}: connection from {:?} rejected", conv, from);
            runtime.release_worker(worker);
            session.release();
            self.release_conv(conv);
            self.socket.send_control(from, &header.reply(conv, SynCommand::Rst));
            return None;
        }

        start_update_timer(runtime, &session);
        self.state.lock().unwrap().sessions.insert(conv, session.clone());
        let close_handler: Weak<dyn SessionCloseHandler> = self.me.clone();
        session.set_close_handler(close_handler);
        info!("conv {:#x}: established with {:?} on worker {:?}", conv, from, worker);

        if session.is_closed() {
            // closed from within the connect callback
            self.on_session_closed(&session, false);
            return None;
        }
        Some(session)
    }

    fn release_conv(&self, conv: u32) {
        self.state.lock().unwrap().convs.release(conv);
    }

    fn on_ack(&self, from: SocketAddr, header: ControlHeader) {
        let closing = {
            let mut state = self.state.lock().unwrap();
            state.half_closed.iter()
                .position(|half_closed| half_closed.sn == header.sn && half_closed.peer_addr == from)
                .map(|pos| state.half_closed.remove(pos))
        };

        match closing {
            Some(closing) => {
                if let (Some(timer), Some(attachment)) = (closing.timer, self.socket.attachment()) {
                    attachment.runtime.del_timer(timer);
                }
                debug!("conv {:#x}: FIN acknowledged by {:?}", closing.conv, from);
                self.teardown(closing.conv, false);
            }
            None => debug!("ACK from {:?} with sn {} matches no pending FIN - ignoring", from, header.sn),
        }
    }

    fn on_fin(&self, from: SocketAddr, header: ControlHeader) {
        let conv = header.conv;
        self.drop_half_open(conv);
        if self.teardown(conv, true) {
            info!("conv {:#x}: closed by {:?}", conv, from);
        }
        else {
            debug!("FIN from {:?} for unknown conv {:#x}", from, conv);
        }

        // duplicate FINs are acknowledged as well
        self.socket.send_control(from, &header.reply(conv, SynCommand::Ack));
    }

    fn on_rst(&self, from: SocketAddr, header: ControlHeader) {
        let conv = header.conv;
        self.drop_half_open(conv);
        if self.teardown(conv, false) {
            info!("conv {:#x}: reset by {:?}", conv, from);
        }
    }

    fn drop_half_open(&self, conv: u32) {
        let dropped = {
            let mut state = self.state.lock().unwrap();
            let dropped = state.half_open.remove(&conv);
            if dropped.is_some() {
                state.convs.release(conv);
            }
            dropped
        };

        if let (Some(half_open), Some(attachment)) = (dropped, self.socket.attachment()) {
            attachment.runtime.del_timer(half_open.timer);
        }
    }

    fn on_disconnect_timeout(&self, conv: u32, sn: u32) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.half_closed.iter()
                .position(|half_closed| half_closed.conv == conv && half_closed.sn == sn)
                .map(|pos| state.half_closed.remove(pos))
        };

        if pending.is_some() {
            warn!("conv {:#x}: FIN not acknowledged within the disconnect timeout - tearing down", conv);
            self.teardown(conv, false);
        }
    }

    /// Removes a session, cancels its timers and releases its conv, then notifies the
    ///  application. With `flush`, the engine gets one last update before it is released.
    ///  Returns false if there is no session for `conv`.
    fn teardown(&self, conv: u32, flush: bool) -> bool {
        let (session, fin_timers) = {
            let mut state = self.state.lock().unwrap();
            let Some(session) = state.sessions.remove(&conv) else {
                return false;
            };
            state.convs.release(conv);

            let mut fin_timers = Vec::new();
            state.half_closed.retain(|half_closed| {
                if half_closed.conv == conv {
                    fin_timers.extend(half_closed.timer);
                    false
                }
                else {
                    true
                }
            });
            (session, fin_timers)
        };

        if let Some(Attachment { runtime, .. }) = self.socket.attachment() {
            for timer in fin_timers {
                runtime.del_timer(timer);
            }
            unbind_session(&runtime, &session);
            if flush {
                session.on_update_timeout(runtime.now_millis());
            }
        }

        let disconnect_callback = self.callbacks.read().unwrap().disconnect.clone();
        if let Some(callback) = disconnect_callback {
            callback(&session);
        }
        session.release();
        true
    }

    fn reset_half_open(&self) {
        let half_open = {
            let mut state = self.state.lock().unwrap();
            let half_open = state.half_open.drain().collect::<Vec<_>>();
            for (conv, _) in &half_open {
                state.convs.release(*conv);
            }
            half_open
        };

        let attachment = self.socket.attachment();
        for (conv, half_open) in half_open {
            if let Some(attachment) = &attachment {
                attachment.runtime.del_timer(half_open.timer);
            }
            self.socket.send_control(half_open.peer_addr, &half_open.header.reply(conv, SynCommand::Rst));
        }
    }
}

impl SessionCloseHandler for KcpServer {
    fn on_session_closed(&self, session: &Arc<KcpSession>, graceful: bool) {
        let conv = session.conv();
        let peer_addr = session.peer_addr();
        let setting = session.setting();
        let sn: u32 = rand::random();

        if !graceful {
            info!("conv {:#x}: resetting connection to {:?}", conv, peer_addr);
            self.socket.send_control(peer_addr, &ControlHeader::new(conv, setting.mode, SynCommand::Rst, sn, setting.send_win_size, setting.recv_win_size));
            self.teardown(conv, false);
            return;
        }

        let Some(Attachment { runtime, .. }) = self.socket.attachment() else {
            // nobody would process the ACK
            self.socket.send_control(peer_addr, &ControlHeader::new(conv, setting.mode, SynCommand::Fin, sn, setting.send_win_size, setting.recv_win_size));
            self.teardown(conv, false);
            return;
        };

        let me = self.me.clone();
        let timer = runtime.add_timer(self.socket.disconnect_timeout().as_millis() as u64, false, session.worker(), move || {
            if let Some(server) = me.upgrade() {
                server.on_disconnect_timeout(conv, sn);
            }
        });
        self.state.lock().unwrap().half_closed.push(HalfClosed {
            conv,
            peer_addr,
            sn,
            timer: Some(timer),
        });

        info!("conv {:#x}: closing connection to {:?} with FIN sn {}", conv, peer_addr, sn);
        self.socket.send_control(peer_addr, &ControlHeader::new(conv, setting.mode, SynCommand::Fin, sn, setting.send_win_size, setting.recv_win_size));
    }
}

impl Endpoint for KcpServer {
    fn socket(&self) -> &KcpSocket {
        &self.socket
    }

    fn attach(self: Arc<Self>, runtime: RuntimeHandle, worker: WorkerId) -> anyhow::Result<()> {
        self.socket.attach(runtime, worker)
    }

    fn detach(&self) {
        self.reset_half_open();
        self.reset_all();
        if let Some(attachment) = self.socket.detach() {
            debug!("detached server {:?} from worker {:?}", self.socket.local_addr(), attachment.worker);
        }
    }

    fn on_read_event(self: Arc<Self>) {
        let span = span!(Level::TRACE, "server_read", local_addr = ?self.socket.local_addr());
        let _entered = span.enter();

        let num_received = self.socket.recv_datagrams(|from, datagram| self.on_datagram(from, datagram));
        trace!("processed {} datagrams", num_received);
    }
}

impl Drop for KcpServer {
    fn drop(&mut self) {
        if !self.socket.config().auto_close {
            return;
        }

        let attachment = self.socket.detach();
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        for (conv, session) in state.sessions.drain() {
            debug!("conv {:#x}: resetting on shutdown", conv);
            let setting = session.setting();
            self.socket.send_control(session.peer_addr(), &ControlHeader::new(conv, setting.mode, SynCommand::Rst, rand::random(), setting.send_win_size, setting.recv_win_size));
            if let Some(Attachment { runtime, .. }) = &attachment {
                unbind_session(runtime, &session);
            }
            session.release();
        }
    }
}
