//! Acknowledgment tracking, retransmission, duplicate suppression and play-data recency.
//!
//! A [`ReliableSender`] is owned per destination. Every message that wants an
//! acknowledgment is encoded once, transmitted once, and kept as a [`PendingSend`] until
//! either the matching [`Ack`](crate::network::messages::Ack) arrives or the retry ceiling
//! is hit. Retransmissions reuse the stored bytes, so a receiver only has to be idempotent
//! per [`MessageIndex`], which [`DuplicateFilter`] provides. Streamed play data is never
//! retransmitted and goes through a [`RecencyFilter`] instead.
//!
//! ```text
//!   send ──► pending ──on_ack──► removed (acknowledged)
//!               │
//!               └─ tick: timeout ──► retransmit (retries += 1)
//!                        timeout after max_retries ──► removed (Expired)
//! ```
//!
//! Nothing here schedules itself. The owning session manager calls
//! [`ReliableSender::tick`] once per frame with the current instant.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;

use tracing::trace;
use web_time::Instant;

use crate::network::codec::{encode_message, CodecResult};
use crate::network::messages::{Message, MessageIndex, MessageKind};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Transport;

/// An outbound message awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// The message's index.
    pub index: MessageIndex,
    /// The message's kind.
    pub kind: MessageKind,
    bytes: Vec<u8>,
    /// When the message was first transmitted.
    pub first_sent: Instant,
    /// When the message was most recently transmitted.
    pub sent_at: Instant,
    /// Retransmissions so far.
    pub retries: u32,
}

impl PendingSend {
    /// The exact bytes that are (re)transmitted.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A tracked send that ran out of retries. The destination should be treated as dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Index of the unacknowledged message.
    pub index: MessageIndex,
    /// Kind of the unacknowledged message.
    pub kind: MessageKind,
}

/// In-flight table for one destination.
#[derive(Debug)]
pub struct ReliableSender {
    destination: SocketAddr,
    pending: BTreeMap<MessageIndex, PendingSend>,
    retry_interval: Duration,
    max_retries: u32,
}

impl ReliableSender {
    /// Creates an empty table for `destination`.
    ///
    /// A tracked message is transmitted at most `1 + max_retries` times.
    #[must_use]
    pub fn new(destination: SocketAddr, retry_interval: Duration, max_retries: u32) -> Self {
        Self {
            destination,
            pending: BTreeMap::new(),
            retry_interval,
            max_retries,
        }
    }

    /// The destination every message of this table goes to.
    #[must_use]
    pub const fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Encodes `msg`, transmits it once and tracks it unless its kind is fire-and-forget.
    ///
    /// Fails only if the message cannot be encoded, in which case nothing is sent.
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        msg: &Message,
        now: Instant,
    ) -> CodecResult<()> {
        let bytes = encode_message(msg)?;
        transport.send_to(&bytes, self.destination);
        let kind = msg.kind();
        trace!(%kind, index = %msg.index, to = %self.destination, "sent");

        if kind.is_fire_and_forget() {
            return Ok(());
        }
        if self.pending.contains_key(&msg.index) {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "index {} to {} is already in flight; not tracking {}",
                msg.index,
                self.destination,
                kind
            );
            return Ok(());
        }
        self.pending.insert(
            msg.index,
            PendingSend {
                index: msg.index,
                kind,
                bytes,
                first_sent: now,
                sent_at: now,
                retries: 0,
            },
        );
        Ok(())
    }

    /// Removes the entry for `index` and returns it. Unknown or repeated indices yield `None`.
    pub fn on_ack(&mut self, index: MessageIndex) -> Option<PendingSend> {
        self.pending.remove(&index)
    }

    /// Retransmits timed-out entries and drops the ones past the retry ceiling.
    ///
    /// Returns one [`Expired`] per dropped entry.
    pub fn tick(&mut self, transport: &dyn Transport, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        for entry in self.pending.values_mut() {
            if now.saturating_duration_since(entry.sent_at) < self.retry_interval {
                continue;
            }
            if entry.retries >= self.max_retries {
                expired.push(Expired {
                    index: entry.index,
                    kind: entry.kind,
                });
                continue;
            }
            transport.send_to(&entry.bytes, self.destination);
            entry.retries += 1;
            entry.sent_at = now;
            trace!(
                kind = %entry.kind,
                index = %entry.index,
                retries = entry.retries,
                to = %self.destination,
                "retransmitted"
            );
        }
        for gone in &expired {
            self.pending.remove(&gone.index);
        }
        expired
    }

    /// Returns `true` if `index` is still awaiting acknowledgment.
    #[must_use]
    pub fn is_pending(&self, index: MessageIndex) -> bool {
        self.pending.contains_key(&index)
    }

    /// Returns `true` if a message of `kind` is awaiting acknowledgment.
    #[must_use]
    pub fn has_pending_kind(&self, kind: MessageKind) -> bool {
        self.pending.values().any(|entry| entry.kind == kind)
    }

    /// Number of messages awaiting acknowledgment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is awaiting acknowledgment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forgets every in-flight message.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// How many accepted indices a [`DuplicateFilter`] remembers.
pub const DUPLICATE_WINDOW: usize = 256;

/// Exactly-once filter for one sender's acknowledged messages.
///
/// An index is accepted the first time it is seen, whatever order it arrives in, so a
/// retransmission that was overtaken by a newer message is still applied. Only the last
/// [`DUPLICATE_WINDOW`] accepted indices are remembered; anything at or below the oldest
/// forgotten one is refused.
///
/// Acknowledgments carry the index of the message they acknowledge, and streamed play data
/// is filtered by [`RecencyFilter`], so callers run neither through this filter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DuplicateFilter {
    seen: BTreeSet<MessageIndex>,
    floor: Option<MessageIndex>,
}

impl DuplicateFilter {
    /// A filter that accepts any first index.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seen: BTreeSet::new(),
            floor: None,
        }
    }

    /// Accepts `index` unless it was accepted before or is older than the window.
    pub fn accept(&mut self, index: MessageIndex) -> bool {
        if self.floor.is_some_and(|floor| index <= floor) || !self.seen.insert(index) {
            return false;
        }
        if self.seen.len() > DUPLICATE_WINDOW {
            self.floor = self.seen.pop_first();
        }
        true
    }

    /// The newest accepted index.
    #[must_use]
    pub fn last_accepted(&self) -> Option<MessageIndex> {
        self.seen.last().copied()
    }
}

/// Newest-wins filter for a stream where a late datagram is worthless.
///
/// Play data is superseded by every later frame, so an index that is not newer than the
/// last applied one is dropped rather than queued.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecencyFilter {
    last_applied: Option<MessageIndex>,
}

impl RecencyFilter {
    /// A filter that accepts any first index.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_applied: None }
    }

    /// Accepts `index` if it is newer than every index accepted so far.
    pub fn accept(&mut self, index: MessageIndex) -> bool {
        match self.last_applied {
            Some(last) if index <= last => false,
            _ => {
                self.last_applied = Some(index);
                true
            },
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
    use crate::network::messages::{Ack, MessageBody};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl Transport for RecordingTransport {
        fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
            self.sent.lock().push((bytes.to_vec(), addr));
        }
    }

    impl RecordingTransport {
        fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 52525)
    }

    fn heartbeat(index: i32) -> Message {
        Message::new(MessageIndex::new(index), MessageBody::Heartbeat)
    }

    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn send_transmits_once_and_tracks() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        sender.send(&transport, &heartbeat(1), Instant::now()).unwrap();

        assert_eq!(transport.count(), 1);
        assert!(sender.is_pending(MessageIndex::new(1)));
        assert!(sender.has_pending_kind(MessageKind::Heartbeat));
    }

    #[test]
    fn fire_and_forget_is_not_tracked() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let ack = Message::new(
            MessageIndex::new(9),
            MessageBody::Ack(Ack::ok(MessageKind::Heartbeat)),
        );
        sender.send(&transport, &ack, Instant::now()).unwrap();

        assert_eq!(transport.count(), 1);
        assert!(sender.is_empty());
    }

    #[test]
    fn ack_removes_exactly_once() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let start = Instant::now();
        sender.send(&transport, &heartbeat(4), start).unwrap();

        let entry = sender.on_ack(MessageIndex::new(4)).unwrap();
        assert_eq!(entry.first_sent, start);
        assert!(sender.on_ack(MessageIndex::new(4)).is_none());
        assert!(sender.on_ack(MessageIndex::new(99)).is_none());
        assert!(sender.is_empty());
    }

    #[test]
    fn nothing_happens_before_the_interval() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let start = Instant::now();
        sender.send(&transport, &heartbeat(1), start).unwrap();

        let expired = sender.tick(&transport, start + Duration::from_millis(4_999));
        assert!(expired.is_empty());
        assert_eq!(transport.count(), 1);
    }

    #[test]
    fn retransmissions_are_bit_identical() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let start = Instant::now();
        sender.send(&transport, &heartbeat(1), start).unwrap();
        sender.tick(&transport, start + INTERVAL);

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[test]
    fn four_attempts_then_expired() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let mut now = Instant::now();
        sender.send(&transport, &heartbeat(7), now).unwrap();

        for _ in 0..3 {
            now += INTERVAL;
            assert!(sender.tick(&transport, now).is_empty());
        }
        assert_eq!(transport.count(), 4);

        now += INTERVAL;
        let expired = sender.tick(&transport, now);
        assert_eq!(
            expired,
            vec![Expired {
                index: MessageIndex::new(7),
                kind: MessageKind::Heartbeat
            }]
        );
        assert_eq!(transport.count(), 4);
        assert!(sender.is_empty());

        now += INTERVAL;
        assert!(sender.tick(&transport, now).is_empty());
    }

    #[test]
    fn ack_after_retry_stops_retransmission() {
        let transport = RecordingTransport::default();
        let mut sender = ReliableSender::new(peer(), INTERVAL, 3);
        let start = Instant::now();
        sender.send(&transport, &heartbeat(1), start).unwrap();
        sender.tick(&transport, start + INTERVAL);

        let entry = sender.on_ack(MessageIndex::new(1)).unwrap();
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.sent_at, start + INTERVAL);

        assert!(sender.tick(&transport, start + INTERVAL * 10).is_empty());
        assert_eq!(transport.count(), 2);
    }

    #[test]
    fn duplicate_filter_accepts_each_index_once() {
        let mut filter = DuplicateFilter::new();
        assert!(filter.accept(MessageIndex::new(3)));
        assert!(!filter.accept(MessageIndex::new(3)));
        assert!(filter.accept(MessageIndex::new(10)));
        assert_eq!(filter.last_accepted(), Some(MessageIndex::new(10)));
    }

    #[test]
    fn overtaken_retransmission_is_accepted_once() {
        let mut filter = DuplicateFilter::new();
        assert!(filter.accept(MessageIndex::new(5)));
        assert!(filter.accept(MessageIndex::new(7)));
        assert!(filter.accept(MessageIndex::new(6)));
        assert!(!filter.accept(MessageIndex::new(6)));
        assert_eq!(filter.last_accepted(), Some(MessageIndex::new(7)));
    }

    #[test]
    fn duplicate_filter_forgets_beyond_its_window() {
        let mut filter = DuplicateFilter::new();
        let window = DUPLICATE_WINDOW as i32;
        for raw in 1..=window + 1 {
            assert!(filter.accept(MessageIndex::new(raw * 2)));
        }
        // 2 was evicted and became the floor; 5 is above it and unseen
        assert!(!filter.accept(MessageIndex::new(1)));
        assert!(!filter.accept(MessageIndex::new(2)));
        assert!(filter.accept(MessageIndex::new(5)));
    }

    #[test]
    fn duplicate_filter_accepts_any_first_index() {
        let mut filter = DuplicateFilter::new();
        assert!(filter.accept(MessageIndex::new(-4)));
    }

    #[test]
    fn recency_filter_accepts_only_newer() {
        let mut filter = RecencyFilter::new();
        assert!(filter.accept(MessageIndex::new(3)));
        assert!(!filter.accept(MessageIndex::new(3)));
        assert!(!filter.accept(MessageIndex::new(2)));
        assert!(filter.accept(MessageIndex::new(10)));
    }
}
