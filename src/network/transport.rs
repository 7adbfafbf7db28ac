//! Routing sends across the host's per-family sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::udp_transport::UdpTransport;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Transport;

/// Sends each datagram through the socket matching the destination's IP family.
///
/// The host binds one socket per family on the same port; either may be missing when the
/// system lacks that family.
#[derive(Debug, Default, Clone)]
pub struct DualStackTransport {
    v4: Option<Arc<UdpTransport>>,
    v6: Option<Arc<UdpTransport>>,
}

impl DualStackTransport {
    /// Routes over the given sockets.
    #[must_use]
    pub fn new(v4: Option<Arc<UdpTransport>>, v6: Option<Arc<UdpTransport>>) -> Self {
        Self { v4, v6 }
    }

    /// The IPv4 socket, if bound.
    #[must_use]
    pub fn v4(&self) -> Option<&Arc<UdpTransport>> {
        self.v4.as_ref()
    }

    /// The IPv6 socket, if bound.
    #[must_use]
    pub fn v6(&self) -> Option<&Arc<UdpTransport>> {
        self.v6.as_ref()
    }
}

impl Transport for DualStackTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref().or(self.v6.as_ref()),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        match socket {
            Some(socket) => socket.send_to(bytes, addr),
            None => report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "no socket bound for the address family of {}",
                addr
            ),
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
    use crate::network::udp_transport::RECV_BUFFER_SIZE;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    #[cfg(not(miri))]
    fn v4_destinations_use_the_v4_socket() {
        let v4 = Arc::new(UdpTransport::bind_v4(0).unwrap());
        let receiver = UdpTransport::bind_v4(0).unwrap();
        let dest = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            receiver.local_addr().unwrap().port(),
        );
        let stack = DualStackTransport::new(Some(v4.clone()), None);
        stack.send_to(&[7, 0, 0, 0, 0], dest);

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut from = None;
        for _ in 0..20 {
            if let Some((_, addr)) = receiver.recv(&mut buf).unwrap() {
                from = Some(addr);
                break;
            }
        }
        assert_eq!(from.unwrap().port(), v4.local_addr().unwrap().port());
    }

    #[test]
    fn missing_family_is_reported_not_panicked() {
        let stack = DualStackTransport::new(None, None);
        stack.send_to(
            &[1],
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 52525),
        );
        assert!(stack.v4().is_none());
        assert!(stack.v6().is_none());
    }
}
