//! Destination address capture for the wildcard listener
//!
//! On Linux the socket is switched to `IP_PKTINFO` and every datagram is read
//! with `recvmsg`, so the local address the sender targeted comes back as a
//! control message. Elsewhere capture is unavailable and the receive loop
//! falls back to a route lookup towards the sender.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

#[cfg(target_os = "linux")]
pub(super) fn enable(socket: &UdpSocket) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(socket, sockopt::Ipv4PacketInfo, &true)?;
    Ok(())
}

#[cfg(target_os = "linux")]
pub(super) fn recv(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
    use std::io::IoSliceMut;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrIn};

    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(libc::in_pktinfo);
    let msg = recvmsg::<SockaddrIn>(socket.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    let mut destination = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            let local = Ipv4Addr::from(u32::from_be(info.ipi_spec_dst.s_addr));
            if !local.is_unspecified() {
                destination = Some(IpAddr::V4(local));
            }
        }
    }

    let source = msg
        .address
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without source address"))?;
    Ok((msg.bytes, SocketAddr::V4(SocketAddrV4::from(source)), destination))
}

#[cfg(not(target_os = "linux"))]
pub(super) fn enable(_socket: &UdpSocket) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "IP_PKTINFO not supported on this platform"))
}

#[cfg(not(target_os = "linux"))]
pub(super) fn recv(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
    let (len, remote) = socket.recv_from(buf)?;
    Ok((len, remote, None))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_loopback_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        enable(&receiver).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello", receiver.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let (len, source, destination) = recv(&receiver, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(source, sender.local_addr().unwrap());
        assert_eq!(destination, Some("127.0.0.1".parse().unwrap()));
    }
}
