//! Reliable, ordered message delivery over UDP with the KCP ARQ protocol.
//!
//! A [endpoint::server::KcpServer] multiplexes many sessions over one UDP socket, a
//!  [endpoint::client::KcpClient] connects one session to a server. Sessions are set up and torn
//!  down with a small handshake of 24 byte control packets (see [protocol]), and each session
//!  runs its own [arq::Kcp] engine for the data.
//!
//! Endpoints are driven by a [manager::ConnectionManager], which polls their sockets for
//!  readability and runs read handlers and timers on a pool of worker threads.

pub mod config;
pub mod protocol;
pub mod arq;
pub mod runtime;
pub mod session;
pub mod endpoint;
pub mod manager;
pub mod util;

#[cfg(test)]
pub mod test_util;
