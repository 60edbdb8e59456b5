//! Endpoints own one UDP socket each and multiplex sessions over it. [KcpSocket] is the part
//!  shared by [server::KcpServer] and [client::KcpClient]: binding, timeouts, draining the
//!  socket and the attachment to a runtime.

pub mod conv_allocator;
pub mod server;
pub mod client;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use anyhow::bail;
use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};
use crate::config::EndpointConfig;
use crate::protocol::{classify, ControlHeader, PacketKind};
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scheduler::WorkerId;
use crate::session::kcp_session::KcpSession;
use crate::session::send_socket::SendSocket;
use crate::util::address::{host_string, resolve_ipv4};

/// Datagrams larger than this are truncated when received
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// An endpoint as seen by the [crate::manager::ConnectionManager]: it is attached to the
///  manager's runtime and pinned to one worker, and its read handler runs on that worker
///  whenever the socket becomes readable.
pub trait Endpoint: Send + Sync + 'static {
    fn socket(&self) -> &KcpSocket;

    fn attach(self: Arc<Self>, runtime: RuntimeHandle, worker: WorkerId) -> anyhow::Result<()>;

    /// Cancels all timers and resets live sessions. The endpoint can be attached again
    ///  afterwards.
    fn detach(&self);

    /// Drains the socket
    fn on_read_event(self: Arc<Self>);
}

#[derive(Clone)]
pub struct Attachment {
    pub runtime: RuntimeHandle,
    pub worker: WorkerId,
}

/// A bound, non-blocking UDP socket plus the settings and runtime attachment of the endpoint
///  using it
pub struct KcpSocket {
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    local_addr: SocketAddr,
    local_host: String,
    config: EndpointConfig,
    connect_timeout_millis: AtomicU64,
    disconnect_timeout_millis: AtomicU64,
    attachment: RwLock<Option<Attachment>>,
    recv_buf: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl KcpSocket {
    /// Binds to `ip:port`. With port 0 the OS picks a port, which is available through
    ///  [KcpSocket::local_port] afterwards.
    pub fn bind(ip: &str, port: u16, config: EndpointConfig) -> anyhow::Result<KcpSocket> {
        config.validate()?;
        let addr = resolve_ipv4(ip, port)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into());

        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        info!("bound UDP socket to {:?}", local_addr);

        Ok(KcpSocket {
            send_socket: Arc::new(socket.clone()),
            socket,
            local_addr,
            local_host: host_string(&local_addr),
            connect_timeout_millis: AtomicU64::new(EndpointConfig::clamp_timeout(config.connect_timeout).as_millis() as u64),
            disconnect_timeout_millis: AtomicU64::new(EndpointConfig::clamp_timeout(config.disconnect_timeout).as_millis() as u64),
            config,
            attachment: RwLock::new(None),
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
            closed: AtomicBool::new(false),
        })
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

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub(crate) fn udp_socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn send_socket(&self) -> Arc<dyn SendSocket> {
        self.send_socket.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis.load(Ordering::Acquire))
    }

    /// Clamped to [100ms, 5000ms]
    pub fn set_connect_timeout(&self, timeout: Duration) {
        let timeout = EndpointConfig::clamp_timeout(timeout);
        self.connect_timeout_millis.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_millis.load(Ordering::Acquire))
    }

    /// Clamped to [100ms, 5000ms]
    pub fn set_disconnect_timeout(&self, timeout: Duration) {
        let timeout = EndpointConfig::clamp_timeout(timeout);
        self.disconnect_timeout_millis.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn attach(&self, runtime: RuntimeHandle, worker: WorkerId) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("endpoint {:?} is closed", self.local_addr);
        }

        let mut attachment = self.attachment.write().unwrap();
        if attachment.is_some() {
            bail!("endpoint {:?} is already attached to a runtime", self.local_addr);
        }
        debug!("attaching endpoint {:?} to worker {:?}", self.local_addr, worker);
        *attachment = Some(Attachment { runtime, worker });
        Ok(())
    }

    pub fn detach(&self) -> Option<Attachment> {
        self.attachment.write().unwrap().take()
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.read().unwrap().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.read().unwrap().is_some()
    }

    /// Stops reading from the socket. The file descriptor itself is released when the last
    ///  reference to the socket is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("closing endpoint {:?}", self.local_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send_control(&self, to: SocketAddr, header: &ControlHeader) {
        trace!("sending {:?} for conv {:#x} sn {} to {:?}", header.command, header.conv, header.sn, to);
        self.send_socket.do_send_packet(to, &header.to_bytes());
    }

    /// Receives until the socket would block, passing each datagram to `on_datagram`. Errors
    ///  other than `WouldBlock` are logged and end the pass. Returns the number of datagrams
    ///  received.
    pub fn recv_datagrams(&self, mut on_datagram: impl FnMut(SocketAddr, &[u8])) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut buf = self.recv_buf.lock().unwrap();
        let mut num_received = 0;
        loop {
            match self.socket.recv_from(&mut buf[..]) {
                Ok((len, from)) => {
                    num_received += 1;
                    trace!("received {} bytes from {:?}", len, from);
                    on_datagram(from, &buf[..len]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("error receiving on UDP socket {:?}: {}", self.local_addr, e);
                    break;
                }
            }
        }
        num_received
    }
}

/// A datagram that passed classification
#[derive(Debug)]
pub(crate) enum Inbound {
    Control(ControlHeader),
    Data { conv: u32 },
}

/// Classifies a received datagram, logging and discarding noise
pub(crate) fn parse_inbound(from: SocketAddr, datagram: &[u8]) -> Option<Inbound> {
    match classify(datagram) {
        None => {
            debug!("dropping datagram of {} bytes from {:?}: shorter than a header", datagram.len(), from);
            None
        }
        Some(PacketKind::Control) => match ControlHeader::deser(&mut &datagram[..]) {
            Ok(header) => Some(Inbound::Control(header)),
            Err(e) => {
                debug!("dropping malformed control packet from {:?}: {}", from, e);
                None
            }
        },
        Some(PacketKind::Data { conv }) => Some(Inbound::Data { conv }),
        Some(PacketKind::Unknown { flag }) => {
            warn!("received a datagram without protocol flag from {:?}: {:#x} - dropping", from, flag);
            None
        }
    }
}

/// Registers the session's recurring update timer, pinned to the session's worker
pub(crate) fn start_update_timer(runtime: &RuntimeHandle, session: &Arc<KcpSession>) {
    let interval = u64::from(session.setting().interval.max(1));
    let clock = runtime.clock();
    let s = session.clone();
    let timer = runtime.add_timer(interval, true, session.worker(), move || {
        s.on_update_timeout(clock.now_millis());
    });
    session.set_update_timer(timer);
}

/// Cancels the update timer and releases the session's worker binding
pub(crate) fn unbind_session(runtime: &RuntimeHandle, session: &KcpSession) {
    if let Some(timer) = session.take_update_timer() {
        runtime.del_timer(timer);
    }
    if let Some(worker) = session.worker() {
        runtime.release_worker(worker);
    }
}
