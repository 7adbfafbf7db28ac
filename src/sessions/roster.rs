//! The host's view of its clients.
//!
//! Each [`Participant`] owns its own [`ReliableSender`], [`DuplicateFilter`] and
//! [`RecencyFilter`], so the retry table and ordering state of one client never affect
//! another.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use web_time::Instant;

use crate::network::messages::MessageIndex;
use crate::network::reliability::{DuplicateFilter, RecencyFilter, ReliableSender};
use crate::{ChartHash, ParticipantId};

/// A client as seen by the host.
#[derive(Debug)]
pub struct Participant {
    /// Locally assigned id, never reused within a session.
    pub id: ParticipantId,
    /// Display name from the join request.
    pub name: String,
    /// The client's endpoint.
    pub addr: SocketAddr,
    /// Cleared once the participant is declared dead, before removal.
    pub alive: bool,
    /// Most recent round-trip estimate, from heartbeat acknowledgments.
    pub rtt: Duration,
    /// When the last heartbeat acknowledgment arrived (or the join, before any).
    pub last_heartbeat: Instant,
    /// When the last heartbeat was issued.
    pub last_heartbeat_sent: Instant,
    /// In-flight messages to this client.
    pub sender: ReliableSender,
    /// Reliable indices already handled from this client.
    pub filter: DuplicateFilter,
    /// Newest play-data index applied from this client.
    pub play_filter: RecencyFilter,
    /// Index of the join request that admitted this client.
    pub join_index: MessageIndex,
    /// The chart this participant has confirmed readiness for. Empty when not ready.
    pub confirmed_chart: ChartHash,
    /// Packed ruleset init received during LOADING.
    pub init_blob: Option<Vec<u8>>,
    /// Latest packed frame received during PLAYING.
    pub latest_frame: Option<Vec<u8>>,
    /// Start offset reported with `ClientFinishedLoading`.
    pub loading_offset_ms: Option<i64>,
    /// Sent `ClientFinishedPlaying` this round.
    pub finished_playing: bool,
    /// Sent `ClientFinishedResult` this round.
    pub finished_result: bool,
}

impl Participant {
    /// Creates a freshly joined participant.
    #[must_use]
    pub fn new(
        id: ParticipantId,
        name: String,
        addr: SocketAddr,
        sender: ReliableSender,
        now: Instant,
    ) -> Self {
        Self {
            id,
            name,
            addr,
            alive: true,
            rtt: Duration::ZERO,
            last_heartbeat: now,
            last_heartbeat_sent: now,
            sender,
            filter: DuplicateFilter::new(),
            play_filter: RecencyFilter::new(),
            join_index: MessageIndex::default(),
            confirmed_chart: ChartHash::empty(),
            init_blob: None,
            latest_frame: None,
            loading_offset_ms: None,
            finished_playing: false,
            finished_result: false,
        }
    }

    /// Half the round-trip estimate, in whole milliseconds.
    #[must_use]
    pub fn half_rtt_ms(&self) -> i64 {
        (self.rtt.as_millis() / 2) as i64
    }

    /// Forgets everything that belongs to one round.
    pub fn clear_round(&mut self) {
        self.confirmed_chart = ChartHash::empty();
        self.init_blob = None;
        self.latest_frame = None;
        self.loading_offset_ms = None;
        self.finished_playing = false;
        self.finished_result = false;
    }
}

/// Every client of one host, keyed by id.
#[derive(Debug)]
pub struct Roster {
    participants: BTreeMap<ParticipantId, Participant>,
    next_id: u32,
    capacity: usize,
}

impl Roster {
    /// An empty roster admitting at most `capacity` clients.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            participants: BTreeMap::new(),
            next_id: ParticipantId::HOST.as_u32() + 1,
            capacity,
        }
    }

    /// Number of clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Returns `true` if there are no clients.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Returns `true` if no further client can be admitted.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    /// The id of the client at `addr`.
    #[must_use]
    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<ParticipantId> {
        self.participants
            .values()
            .find(|p| p.addr == *addr)
            .map(|p| p.id)
    }

    /// Returns the next id without consuming it.
    #[must_use]
    pub const fn peek_next_id(&self) -> ParticipantId {
        ParticipantId::new(self.next_id)
    }

    /// Adds a client under the next id. The caller checks capacity and duplicates first.
    pub fn insert(
        &mut self,
        name: String,
        addr: SocketAddr,
        sender: ReliableSender,
        now: Instant,
    ) -> ParticipantId {
        let id = ParticipantId::new(self.next_id);
        self.next_id += 1;
        self.participants
            .insert(id, Participant::new(id, name, addr, sender, now));
        id
    }

    /// Removes a client.
    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id)
    }

    /// A client by id.
    #[must_use]
    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// A client by id, mutably.
    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(&id)
    }

    /// Clients in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Clients in id order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.values_mut()
    }

    /// Client ids in order.
    #[must_use]
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    /// Client endpoints in id order.
    #[must_use]
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.participants.values().map(|p| p.addr).collect()
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
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn sender(port: u16) -> ReliableSender {
        ReliableSender::new(addr(port), Duration::from_secs(5), 3)
    }

    #[test]
    fn ids_start_after_host_and_are_never_reused() {
        let mut roster = Roster::new(4);
        let now = Instant::now();
        let a = roster.insert("a".into(), addr(1), sender(1), now);
        let b = roster.insert("b".into(), addr(2), sender(2), now);
        assert_eq!(a, ParticipantId::new(1));
        assert_eq!(b, ParticipantId::new(2));

        roster.remove(a);
        let c = roster.insert("c".into(), addr(3), sender(3), now);
        assert_eq!(c, ParticipantId::new(3));
        assert_eq!(roster.ids(), vec![b, c]);
    }

    #[test]
    fn capacity_counts_clients_only() {
        let mut roster = Roster::new(1);
        assert!(!roster.is_full());
        roster.insert("a".into(), addr(1), sender(1), Instant::now());
        assert!(roster.is_full());
    }

    #[test]
    fn lookup_by_address() {
        let mut roster = Roster::new(4);
        let id = roster.insert("a".into(), addr(7), sender(7), Instant::now());
        assert_eq!(roster.id_by_addr(&addr(7)), Some(id));
        assert_eq!(roster.id_by_addr(&addr(8)), None);
    }

    #[test]
    fn half_rtt_rounds_down_to_millis() {
        let mut roster = Roster::new(4);
        let id = roster.insert("a".into(), addr(1), sender(1), Instant::now());
        let p = roster.get_mut(id).unwrap();
        p.rtt = Duration::from_micros(40_900);
        assert_eq!(p.half_rtt_ms(), 20);
    }

    #[test]
    fn clear_round_keeps_identity() {
        let mut roster = Roster::new(4);
        let id = roster.insert("a".into(), addr(1), sender(1), Instant::now());
        let p = roster.get_mut(id).unwrap();
        p.confirmed_chart = ChartHash::new("x");
        p.finished_playing = true;
        p.loading_offset_ms = Some(10);
        p.clear_round();
        assert!(p.confirmed_chart.is_empty());
        assert!(!p.finished_playing);
        assert_eq!(p.loading_offset_ms, None);
        assert_eq!(p.name, "a");
    }
}
