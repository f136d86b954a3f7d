//! Protected socket creation and the fd handoff
//!
//! Every socket is opened in the IPv6 family so one family serves both v4
//! destinations (via v4-mapped addresses) and native v6. The raw fd goes to
//! the host's `protect` callback before any bind or connect; a refused fd is
//! closed on the spot and never used.
//!
//! Ownership: the fd belongs to this module between `socket()` and the
//! conversion into a tokio type, which detaches it into the returned
//! connection. Every early return in between drops the owning handle and
//! closes the fd; nothing leaks and nothing double-closes.

use super::{DialerError, Network};
use crate::callback::HostCallbacks;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// A protected outbound connection handed back to the proxy core.
#[derive(Debug)]
pub enum ProtectedConn {
    /// Connected TCP stream
    Stream(TcpStream),
    /// Unconnected datagram socket paired with its remote address
    Datagram(DatagramConn),
}

/// Datagram connection over an unconnected wildcard-bound socket.
///
/// The socket is never connected; the remote travels alongside it and is
/// supplied on every send.
#[derive(Debug)]
pub struct DatagramConn {
    socket: UdpSocket,
    target: SocketAddr,
}

impl DatagramConn {
    /// The remote this connection is paired with
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// The underlying socket
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send a datagram to the paired remote.
    pub async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(buf, self.target).await
    }

    /// Receive a datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Split into the socket and its paired remote.
    pub fn into_parts(self) -> (UdpSocket, SocketAddr) {
        (self.socket, self.target)
    }
}

/// v4-mapped form so an AF_INET6 socket reaches v4 destinations.
fn to_v6_sockaddr(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

pub(super) async fn open_protected(
    callbacks: &dyn HostCallbacks,
    network: Network,
    target: SocketAddr,
) -> Result<ProtectedConn, DialerError> {
    match network {
        Network::Tcp => open_tcp(callbacks, target).await.map(ProtectedConn::Stream),
        Network::Udp => open_udp(callbacks, target).map(ProtectedConn::Datagram),
    }
}

async fn open_tcp(
    callbacks: &dyn HostCallbacks,
    target: SocketAddr,
) -> Result<TcpStream, DialerError> {
    let socket = new_socket(Type::STREAM, Protocol::TCP)?;
    protect(callbacks, &socket)?;

    let target = SocketAddr::V6(to_v6_sockaddr(target));
    let socket = TcpSocket::from_std_stream(socket.into());
    socket
        .connect(target)
        .await
        .map_err(|source| DialerError::Connect {
            addr: target,
            source,
        })
}

fn open_udp(
    callbacks: &dyn HostCallbacks,
    target: SocketAddr,
) -> Result<DatagramConn, DialerError> {
    let socket = new_socket(Type::DGRAM, Protocol::UDP)?;
    protect(callbacks, &socket)?;

    // wildcard bind, never connected; the remote rides with the connection
    let wildcard = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
    socket.bind(&wildcard.into()).map_err(DialerError::Bind)?;

    let socket = UdpSocket::from_std(socket.into()).map_err(DialerError::SocketCreate)?;
    Ok(DatagramConn {
        socket,
        target: SocketAddr::V6(to_v6_sockaddr(target)),
    })
}

fn new_socket(ty: Type, protocol: Protocol) -> Result<Socket, DialerError> {
    let socket = Socket::new(Domain::IPV6, ty, Some(protocol)).map_err(DialerError::SocketCreate)?;
    socket
        .set_nonblocking(true)
        .map_err(DialerError::SocketCreate)?;
    // dual stack: v4 destinations are reached through v4-mapped addresses
    socket.set_only_v6(false).map_err(DialerError::SocketCreate)?;
    Ok(socket)
}

/// Hand the fd to the host. A refusal closes the socket via the caller's
/// drop before any connect or bind is attempted.
fn protect(callbacks: &dyn HostCallbacks, socket: &Socket) -> Result<(), DialerError> {
    let fd = socket.as_raw_fd();
    if callbacks.protect(fd) {
        debug!(fd, "socket protected");
        Ok(())
    } else {
        warn!(fd, "host refused to protect socket");
        Err(DialerError::ProtectFail(fd))
    }
}
