#[cfg(test)] use mockall::automock;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use mio::net::UdpSocket;
use tracing::{error, trace, warn};

/// This is an abstraction for sending a datagram on the endpoint's UDP socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

impl SendSocket for Arc<UdpSocket> {
    fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match self.send_to(packet_buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                // the engine retransmits, a dropped datagram is just a lost datagram
                warn!("UDP send buffer full, dropping packet to {:?}", to);
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
