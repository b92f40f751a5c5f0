//! Network helpers shared by the listeners and the control bridge

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

/// Resolve a textual host and port to an IPv4 socket address.
///
/// Only numeric ports are understood. The first IPv4 result wins.
pub fn resolve(host: &str, port: &str) -> Result<SocketAddr> {
    let port_num: u16 = port
        .trim()
        .parse()
        .map_err(|_| Error::resolve(host, port, "invalid port"))?;

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port_num));
    }

    (host, port_num)
        .to_socket_addrs()
        .map_err(|e| Error::resolve(host, port, e.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::resolve(host, port, "no IPv4 address"))
}

/// Local address the kernel would use to reach `remote`.
///
/// Connecting a throwaway UDP socket does not send anything; it only runs
/// the route lookup and fixes the source address.
pub fn local_for_remote(remote: SocketAddr) -> std::io::Result<IpAddr> {
    let bind_addr: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let route_socket = UdpSocket::bind(bind_addr)?;
    route_socket.connect(remote)?;
    Ok(route_socket.local_addr()?.ip())
}

/// Current wall-clock time in seconds, with microsecond resolution
pub fn now_dtime() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as f64 + f64::from(elapsed.subsec_micros()) / 1_000_000.0,
        Err(_) => -1.0,
    }
}

/// Bind a UDP socket with `SO_REUSEADDR` on `addr:port`
pub fn bind_udp(addr: &str, port: u16) -> Result<UdpSocket> {
    let local = resolve(addr, &port.to_string())?;
    let bind_err = |source| Error::Bind {
        addr: addr.to_string(),
        port,
        source,
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&local.into()).map_err(bind_err)?;
    Ok(socket.into())
}

/// Bind and listen on a TCP socket with `SO_REUSEADDR` on `addr:port`
pub fn bind_tcp(addr: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let local = resolve(addr, &port.to_string())?;
    let bind_err = |source| Error::Bind {
        addr: addr.to_string(),
        port,
        source,
    };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&local.into()).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_numeric() {
        let addr = resolve("192.0.2.10", "5070").unwrap();
        assert_eq!(addr, "192.0.2.10:5070".parse().unwrap());
    }

    #[test]
    fn test_resolve_localhost_name() {
        let addr = resolve("localhost", "5060").unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 5060);
    }

    #[test]
    fn test_resolve_rejects_service_names() {
        assert!(matches!(resolve("127.0.0.1", "sip"), Err(Error::Resolve { .. })));
        assert!(matches!(resolve("127.0.0.1", "70000"), Err(Error::Resolve { .. })));
    }

    #[test]
    fn test_local_for_loopback() {
        let local = local_for_remote("127.0.0.1:5060".parse().unwrap()).unwrap();
        assert_eq!(local, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_now_dtime_is_recent() {
        let now = now_dtime();
        assert!(now > 1_600_000_000.0);
        assert!(now_dtime() >= now);
    }

    #[test]
    fn test_bind_udp_with_reuse() {
        let socket = bind_udp("127.0.0.1", 0).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_bind_tcp_listens() {
        let listener = bind_tcp("127.0.0.1", 0, 32).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }
}
