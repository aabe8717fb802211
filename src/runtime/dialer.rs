//! Client-side connections.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use super::connection::TcpConn;
use super::service::TcpOptions;
use super::udp::{UdpConn, UdpOptions};

fn resolve(addr: impl ToSocketAddrs) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address resolved to nothing",
        ));
    }
    Ok(addrs)
}

/// Connect to `addr`, trying each resolved address in turn.
///
/// A zero `timeout` waits for the OS connect timeout. The returned connection
/// has no request handler, so reads block until data arrives.
pub fn dial_tcp(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<TcpConn> {
    dial_tcp_with(addr, timeout, &TcpOptions::default().with_nonblocking(false))
}

/// [`dial_tcp`] with explicit connection options.
pub fn dial_tcp_with(
    addr: impl ToSocketAddrs,
    timeout: Duration,
    options: &TcpOptions,
) -> io::Result<TcpConn> {
    let stream = connect_stream(addr, timeout)?;
    TcpConn::attach(stream, options)
}

/// Open a blocking `std` stream, used when the caller wraps it itself
/// (TLS, for instance).
pub(crate) fn connect_stream(
    addr: impl ToSocketAddrs,
    timeout: Duration,
) -> io::Result<std::net::TcpStream> {
    let mut last_err = None;
    for addr in resolve(addr)? {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        let connected = if timeout.is_zero() {
            socket.connect(&addr.into())
        } else {
            socket.connect_timeout(&addr.into(), timeout)
        };
        match connected {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

/// Create a UDP connection bound to an ephemeral port and connected to `addr`.
pub fn dial_udp(addr: impl ToSocketAddrs) -> io::Result<UdpConn> {
    let target = resolve(addr)?[0];
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => "0.0.0.0:0".parse(),
        SocketAddr::V6(_) => "[::]:0".parse(),
    }
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let socket = UdpSocket::bind(local)?;
    socket.connect(target)?;
    UdpConn::attach(socket, &UdpOptions::default().with_nonblocking(false))
}
