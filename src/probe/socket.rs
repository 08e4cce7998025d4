use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// One ICMP endpoint for a single address family.
///
/// Privileged mode opens a raw socket (CAP_NET_RAW); unprivileged mode opens
/// a datagram ICMP socket, for which the kernel assigns the echo Identifier
/// and `net.ipv4.ping_group_range` must include the process's group. Either
/// way the fd is wrapped in a tokio `UdpSocket` for async send/recv — ICMP
/// sockets are connectionless datagram fds, so the wrapper fits.
#[derive(Debug)]
pub struct IcmpSocket {
    inner: UdpSocket,
    v6: bool,
}

impl IcmpSocket {
    /// Opens and binds an endpoint. Must be called within a tokio runtime.
    pub fn open(bind: IpAddr, privileged: bool) -> io::Result<IcmpSocket> {
        let v6 = bind.is_ipv6();

        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
        let kind = if privileged { Type::RAW } else { Type::DGRAM };
        let protocol = if v6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 };

        let socket = Socket::new(domain, kind, Some(protocol))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(bind, 0).into())?;

        let inner = UdpSocket::from_std(socket.into())?;
        Ok(IcmpSocket { inner, v6 })
    }

    pub fn is_v6(&self) -> bool {
        self.v6
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        Ok((n, addr.ip()))
    }

    pub async fn send_to(&self, packet: &[u8], dst: IpAddr) -> io::Result<usize> {
        self.inner.send_to(packet, SocketAddr::new(dst, 0)).await
    }

    /// Applies SO_MARK to the underlying fd.
    #[cfg(target_os = "linux")]
    pub fn set_mark(&self, mark: u32) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_mark(mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn open_unprivileged_endpoints() {
        // needs net.ipv4.ping_group_range to cover our gid; skip when not
        let Ok(sock4) = IcmpSocket::open(IpAddr::V4(Ipv4Addr::UNSPECIFIED), false) else {
            eprintln!("skipping: unable to open datagram ICMP socket");
            return;
        };
        assert!(!sock4.is_v6());

        if let Ok(sock6) = IcmpSocket::open(IpAddr::V6(Ipv6Addr::UNSPECIFIED), false) {
            assert!(sock6.is_v6());
        }
    }
}
