//! Helpers for tests that drive endpoints against real loopback sockets, with a manually
//!  advanced clock so that timeouts fire exactly when a test wants them to.

use std::net::{SocketAddr, UdpSocket};
use std::ops::Deref;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use crate::arq::{Kcp, KcpOutput};
use crate::protocol::{classify, ControlHeader, PacketKind};
use crate::runtime::clock::ManualClock;
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::timer::{TimerFrontListener, TimerManager};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct NoFrontListener;
impl TimerFrontListener for NoFrontListener {
    fn on_timer_inserted_at_front(&self) {}
}

/// A started scheduler with timers on a [ManualClock]. Nothing fires timers automatically,
///  tests do that with [TestRuntime::run_expired_timers]. The scheduler is stopped on drop.
pub struct TestRuntime {
    pub handle: RuntimeHandle,
    pub clock: Arc<ManualClock>,
}

impl TestRuntime {
    pub fn new(name: &str, num_workers: usize) -> TestRuntime {
        let clock = Arc::new(ManualClock::new(1_000));
        let timers = Arc::new(TimerManager::new(clock.clone(), Arc::new(NoFrontListener)));
        let scheduler = Arc::new(Scheduler::new(name, num_workers));
        scheduler.start().unwrap();
        TestRuntime {
            handle: RuntimeHandle::new(scheduler, timers),
            clock,
        }
    }

    /// Advances the clock and runs every expired timer's callback on the calling thread
    pub fn advance_and_run(&self, millis: u64) -> usize {
        self.clock.advance(millis);
        self.run_expired_timers()
    }

    pub fn run_expired_timers(&self) -> usize {
        let expired = self.handle.timers().list_expired();
        let num_expired = expired.len();
        for timer in expired {
            (timer.callback)();
        }
        num_expired
    }
}

impl Deref for TestRuntime {
    type Target = RuntimeHandle;

    fn deref(&self) -> &RuntimeHandle {
        &self.handle
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.handle.scheduler().stop();
    }
}

/// A plain blocking socket playing the remote side of a handshake
pub struct RawPeer {
    pub socket: UdpSocket,
}

impl RawPeer {
    pub fn new() -> RawPeer {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        RawPeer { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn send_control(&self, to: SocketAddr, header: &ControlHeader) {
        self.socket.send_to(&header.to_bytes(), to).unwrap();
    }

    /// The next control packet, skipping data packets
    pub fn recv_control(&self) -> ControlHeader {
        self.try_recv_control(RECV_TIMEOUT)
            .expect("no control packet received")
    }

    pub fn try_recv_control(&self, timeout: Duration) -> Option<ControlHeader> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.socket.set_read_timeout(Some(remaining.max(Duration::from_millis(1)))).unwrap();
            let Ok((len, _)) = self.socket.recv_from(&mut buf) else {
                return None;
            };
            if classify(&buf[..len]) == Some(PacketKind::Control) {
                return ControlHeader::deser(&mut &buf[..len]).ok();
            }
        }
    }
}

impl Default for RawPeer {
    fn default() -> Self {
        RawPeer::new()
    }
}

/// Collects an engine's output so that tests can hand it to an endpoint explicitly
#[derive(Clone, Default)]
pub struct CapturingOutput {
    pub packets: Arc<Mutex<Vec<Vec<u8>>>>,
}
impl CapturingOutput {
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.packets.lock().unwrap())
    }
}
impl KcpOutput for CapturingOutput {
    fn output(&mut self, packet: &[u8]) {
        self.packets.lock().unwrap().push(packet.to_vec());
    }
}

/// A bare engine for `conv` that has `message` queued and flushed, returning the datagrams.
///  The congestion window is off so that the first flush already carries every fragment.
pub fn data_packets(conv: u32, message: &[u8]) -> Vec<Vec<u8>> {
    let output = CapturingOutput::default();
    let mut engine = Kcp::new(conv, output.clone());
    engine.set_nodelay(true, 10, 2, true);
    engine.send(message).unwrap();
    engine.update(0);
    output.take()
}

pub fn recv_within<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(RECV_TIMEOUT)
        .expect("nothing received in time")
}

pub fn assert_nothing_within<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>, timeout: Duration) {
    if let Ok(item) = rx.recv_timeout(timeout) {
        panic!("unexpectedly received {:?}", item);
    }
}

/// Polls `condition` until it holds or the timeout expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::single_segment(10)]
    #[case::fragmented(5000)]
    fn test_data_packets_carry_the_whole_message(#[case] len: usize) {
        let message = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let packets = data_packets(0x4B435001, &message);
        assert!(!packets.is_empty());

        let mut receiver = Kcp::new(0x4B435001, CapturingOutput::default());
        for packet in &packets {
            receiver.input(packet).unwrap();
        }
        let mut buf = BytesMut::new();
        assert_eq!(receiver.recv(&mut buf), Ok(len));
        assert_eq!(buf.to_vec(), message);
    }
}
