//! A UDP socket for reactor threads.
//!
//! Receives block for at most a short read timeout so a reactor thread can notice a stop
//! request; sends never block.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Transport;

/// Receive buffer size; larger datagrams are truncated by the OS and then fail to decode.
pub const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;
/// How long `recv` waits before returning `None`.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A bound UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds to `addr` with the reactor read timeout.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self { socket })
    }

    /// Binds to `0.0.0.0:port`.
    pub fn bind_v4(port: u16) -> io::Result<Self> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to `[::]:port`.
    pub fn bind_v6(port: u16) -> io::Result<Self> {
        Self::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Allows sending to broadcast addresses.
    pub fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.socket.set_broadcast(on)
    }

    /// Receives one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when the read timeout elapses, or when the OS reports a reset
    /// caused by an earlier send to a closed port.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(ref err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            },
            // datagram sockets sometimes get this as a result of an earlier send_to
            Err(ref err) if err.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
        if bytes.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                bytes.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        // UDP is best-effort; a failed send is indistinguishable from a lost packet.
        if let Err(e) = self.socket.send_to(bytes, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Failed to send UDP packet to {}: {}",
                addr,
                e
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn loopback(transport: &UdpTransport) -> SocketAddr {
        let port = transport.local_addr().unwrap().port();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    #[cfg(not(miri))]
    fn recv_times_out_with_none() {
        let transport = UdpTransport::bind_v4(0).unwrap();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        assert!(transport.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    #[cfg(not(miri))]
    fn send_and_receive_on_loopback() {
        let a = UdpTransport::bind_v4(0).unwrap();
        let b = UdpTransport::bind_v4(0).unwrap();
        a.send_to(&[5, 1, 0, 0, 0], loopback(&b));

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut got = None;
        for _ in 0..20 {
            if let Some(hit) = b.recv(&mut buf).unwrap() {
                got = Some(hit);
                break;
            }
        }
        let (len, from) = got.expect("datagram should arrive on loopback");
        assert_eq!(&buf[..len], &[5, 1, 0, 0, 0]);
        assert_eq!(from.port(), a.local_addr().unwrap().port());
    }
}
