use std::time::Duration;
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Engine tuning preset, negotiated during the handshake and applied on both sides
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
pub enum KcpMode {
    #[default]
    Normal = 0,
    Fast = 1,
    Fast2 = 2,
    Fast3 = 3,
}

/// Parameters for one engine instance
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KcpSetting {
    pub conv: u32,
    pub mode: KcpMode,
    pub send_win_size: u32,
    pub recv_win_size: u32,
    /// Use the reduced minimum RTO and the gentler RTO backoff
    pub nodelay: bool,
    /// Internal update interval in ms. This is also the period of the session's update timer.
    pub interval: u32,
    /// Number of duplicate ACKs that trigger a fast retransmit, 0 to disable
    pub fast_resend: u32,
    /// Disable the congestion window, i.e. send limited only by send and receive window
    pub nocwnd: bool,
    pub mtu: u32,
}

impl KcpSetting {
    pub const DEFAULT_WINDOW_SIZE: u32 = 512;
    pub const DEFAULT_INTERVAL: u32 = 40;

    /// The preset for a mode. Window sizes of 0 fall back to the default.
    pub fn for_mode(conv: u32, mode: KcpMode, send_win_size: u32, recv_win_size: u32) -> KcpSetting {
        let (nodelay, interval, fast_resend, nocwnd) = match mode {
            KcpMode::Normal => (false, Self::DEFAULT_INTERVAL, 0, false),
            KcpMode::Fast => (false, 30, 2, true),
            KcpMode::Fast2 => (true, 20, 2, true),
            KcpMode::Fast3 => (true, 10, 2, true),
        };

        KcpSetting {
            conv,
            mode,
            send_win_size: if send_win_size == 0 { Self::DEFAULT_WINDOW_SIZE } else { send_win_size },
            recv_win_size: if recv_win_size == 0 { Self::DEFAULT_WINDOW_SIZE } else { recv_win_size },
            nodelay,
            interval,
            fast_resend,
            nocwnd,
            mtu: crate::protocol::MTU_SIZE as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Time a server keeps a half-open conversation (SYN answered, no data yet) before it is
    ///  dropped and its conv is released
    pub connect_timeout: Duration,
    /// Time to wait for the ACK of a FIN before the session is torn down anyway
    pub disconnect_timeout: Duration,

    /// Upper bound for bytes queued per session that were accepted by `send` but not yet moved
    ///  into the engine. `send` fails rather than exceeding this.
    pub send_buffer_capacity: usize,
    /// Number of MTU sized segments worth of queued data moved into the engine per update tick
    pub max_segments_per_update: usize,

    /// Window sizes a client requests during the handshake
    pub send_win_size: u32,
    pub recv_win_size: u32,

    /// Tear down all live sessions when the endpoint is dropped
    pub auto_close: bool,
}

impl EndpointConfig {
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);
    pub const MAX_TIMEOUT: Duration = Duration::from_millis(5000);

    pub fn clamp_timeout(timeout: Duration) -> Duration {
        timeout.clamp(Self::MIN_TIMEOUT, Self::MAX_TIMEOUT)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_buffer_capacity == 0 {
            bail!("send buffer capacity must not be 0");
        }
        if self.max_segments_per_update == 0 {
            bail!("max segments per update must not be 0");
        }
        if Self::clamp_timeout(self.connect_timeout) != self.connect_timeout {
            bail!("connect timeout {:?} is outside of [{:?}, {:?}]", self.connect_timeout, Self::MIN_TIMEOUT, Self::MAX_TIMEOUT);
        }
        if Self::clamp_timeout(self.disconnect_timeout) != self.disconnect_timeout {
            bail!("disconnect timeout {:?} is outside of [{:?}, {:?}]", self.disconnect_timeout, Self::MIN_TIMEOUT, Self::MAX_TIMEOUT);
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            connect_timeout: Duration::from_millis(3000),
            disconnect_timeout: Duration::from_millis(3000),
            send_buffer_capacity: 1024*1024,
            max_segments_per_update: 128,
            send_win_size: KcpSetting::DEFAULT_WINDOW_SIZE,
            recv_win_size: KcpSetting::DEFAULT_WINDOW_SIZE,
            auto_close: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// used as a prefix for thread names
    pub name: String,
    pub num_workers: usize,
    pub max_endpoints: usize,
    /// capacity of the readiness event buffer per poll call
    pub max_events: usize,
}

impl ManagerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_workers == 0 {
            bail!("at least one worker thread is required");
        }
        if self.max_endpoints == 0 {
            bail!("max endpoints must not be 0");
        }
        if self.max_events == 0 {
            bail!("max events must not be 0");
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            name: "kcp".to_string(),
            num_workers: 1,
            max_endpoints: 1024,
            max_events: 1024,
        }
    }
}
