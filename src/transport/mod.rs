//! The transport plane: dual-stack listening sockets, meta-connection
//! accept/connect, and the UDP datagram path.

pub mod udp;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::*;

pub use udp::{MtuProber, UdpHeader, UDP_HEADER_LEN};

/// Both listening sockets (meta-TCP and datagram-UDP) bound to the
/// same port on the IPv4 and IPv6 wildcard addresses.
pub struct Listeners {
    pub tcp_v4: TcpListener,
    pub tcp_v6: TcpListener,
    pub udp_v4: UdpSocket,
    pub udp_v6: UdpSocket,
    port: u16,
}

impl Listeners {
    /// Binds both families on `port`. `port == 0` means OS-assigned: the
    /// first bind (IPv6) picks the port, and the IPv4 bind reuses it, so
    /// both sockets end up on the same number.
    ///
    /// Whatever port is actually bound is read back from the socket, so
    /// `get_port` never reports 0 once this returns.
    pub async fn bind(port: u16) -> Result<Self> {
        let tcp_v6 = bind_tcp(Domain::IPV6, SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)))?;
        let bound_port = tcp_v6.local_addr().wrapped(ErrorKind::Network)?.port();

        let tcp_v4 = bind_tcp(Domain::IPV4, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bound_port)))?;

        let udp_v6 = bind_udp(Domain::IPV6, SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, bound_port, 0, 0)))?;
        let udp_v4 = bind_udp(Domain::IPV4, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bound_port)))?;

        Ok(Listeners {
            tcp_v4: TcpListener::from_std(tcp_v4).wrapped(ErrorKind::Network)?,
            tcp_v6: TcpListener::from_std(tcp_v6).wrapped(ErrorKind::Network)?,
            udp_v4: UdpSocket::from_std(udp_v4).wrapped(ErrorKind::Network)?,
            udp_v6: UdpSocket::from_std(udp_v6).wrapped(ErrorKind::Network)?,
            port: bound_port,
        })
    }

    /// The port actually bound; never 0 once `bind` has succeeded.
    pub fn get_port(&self) -> u16 {
        self.port
    }
}

fn bind_tcp(domain: Domain, addr: SocketAddr) -> Result<std::net::TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, None).wrapped(ErrorKind::Network)?;
    socket.set_reuse_address(true).wrapped(ErrorKind::Network)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true).wrapped(ErrorKind::Network)?;
    }
    socket.bind(&addr.into()).wrapped(ErrorKind::Network)?;
    socket.listen(128).wrapped(ErrorKind::Network)?;
    socket.set_nonblocking(true).wrapped(ErrorKind::Network)?;
    Ok(socket.into())
}

fn bind_udp(domain: Domain, addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, None).wrapped(ErrorKind::Network)?;
    socket.set_reuse_address(true).wrapped(ErrorKind::Network)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true).wrapped(ErrorKind::Network)?;
    }
    socket.bind(&addr.into()).wrapped(ErrorKind::Network)?;
    socket.set_nonblocking(true).wrapped(ErrorKind::Network)?;
    Ok(socket.into())
}

/// Connects the meta-TCP stream used to reach `addr`, the first step of
/// `CONNECTING` in the meta-connection state machine.
pub async fn connect_meta(addr: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(addr).await.wrapped(ErrorKind::Network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_port_zero_picks_a_real_matching_port_on_both_families() {
        let listeners = tokio_test::block_on(Listeners::bind(0)).unwrap();
        assert_ne!(listeners.get_port(), 0);
        assert_eq!(listeners.tcp_v4.local_addr().unwrap().port(), listeners.get_port());
        assert_eq!(listeners.tcp_v6.local_addr().unwrap().port(), listeners.get_port());
    }

    #[test]
    fn connect_meta_fails_fast_against_a_closed_port() {
        let err = tokio_test::block_on(connect_meta("127.0.0.1:1".parse().unwrap())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
