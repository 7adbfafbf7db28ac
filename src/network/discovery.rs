//! LAN lobby discovery.
//!
//! A seeker broadcasts [`MessageKind::SeekLobby`](crate::network::messages::MessageKind)
//! to the hosting port; every host answers with a
//! [`LobbyAdvert`](crate::network::messages::LobbyAdvert). Neither direction is
//! acknowledged or authenticated.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::debug;
use web_time::Instant;

use crate::network::codec::{decode_message, encode_message};
use crate::network::messages::{Message, MessageBody, MessageIndex};
use crate::network::udp_transport::{UdpTransport, RECV_BUFFER_SIZE};
use crate::sessions::config::ArenaConfig;
use crate::{ArenaError, Transport};

/// A lobby that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LobbyInfo {
    /// The host's display name.
    pub name: String,
    /// Where the answer came from.
    pub addr: IpAddr,
    /// The port the host listens on.
    pub port: u16,
}

impl LobbyInfo {
    /// The endpoint to join.
    #[must_use]
    pub const fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Broadcasts a probe on `config.port` and collects answers for `config.discovery_timeout`.
pub fn seek_lobbies(config: &ArenaConfig) -> Result<Vec<LobbyInfo>, ArenaError> {
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.port);
    seek_lobbies_at(config, target)
}

/// Sends a probe to `target` and collects answers for `config.discovery_timeout`.
///
/// Answers are deduplicated and returned sorted.
pub fn seek_lobbies_at(
    config: &ArenaConfig,
    target: SocketAddr,
) -> Result<Vec<LobbyInfo>, ArenaError> {
    let socket = match target {
        SocketAddr::V4(_) => UdpTransport::bind_v4(0)?,
        SocketAddr::V6(_) => UdpTransport::bind_v6(0)?,
    };
    if target.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    let probe = encode_message(&Message::new(MessageIndex::new(0), MessageBody::SeekLobby))?;
    socket.send_to(&probe, target);

    let deadline = Instant::now() + config.discovery_timeout;
    let mut found = BTreeSet::new();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    while Instant::now() < deadline {
        let Some((len, from)) = socket.recv(&mut buf)? else {
            continue;
        };
        if let Some(info) = buf.get(..len).and_then(|bytes| parse_reply(bytes, from)) {
            found.insert(info);
        }
    }
    debug!(count = found.len(), %target, "lobby discovery finished");
    Ok(found.into_iter().collect())
}

/// Interprets one datagram as a discovery answer.
fn parse_reply(bytes: &[u8], from: SocketAddr) -> Option<LobbyInfo> {
    match decode_message(bytes).ok()?.body {
        MessageBody::SeekLobbyReply(advert) => Some(LobbyInfo {
            name: advert.name,
            addr: from.ip(),
            port: advert.port,
        }),
        _ => None,
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
    use crate::network::messages::LobbyAdvert;

    fn from() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn reply_uses_sender_ip_and_advertised_port() {
        let reply = Message::new(
            MessageIndex::new(0),
            MessageBody::SeekLobbyReply(LobbyAdvert {
                name: "rin's room".into(),
                port: 52525,
            }),
        );
        let info = parse_reply(&encode_message(&reply).unwrap(), from()).unwrap();
        assert_eq!(info.name, "rin's room");
        assert_eq!(info.endpoint(), "192.168.1.20:52525".parse().unwrap());
    }

    #[test]
    fn other_messages_are_ignored() {
        let heartbeat = Message::new(MessageIndex::new(1), MessageBody::Heartbeat);
        assert!(parse_reply(&encode_message(&heartbeat).unwrap(), from()).is_none());
        assert!(parse_reply(&[2, 0], from()).is_none());
    }
}
