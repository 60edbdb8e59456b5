use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use anyhow::anyhow;

/// Resolves `host` to an IPv4 socket address. Only IPv4 is supported on the wire, so names
///  resolving exclusively to IPv6 addresses are rejected.
pub fn resolve_ipv4(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }

    (host, port).to_socket_addrs()?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("{} does not resolve to an IPv4 address", host))
}

pub fn host_string(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}
