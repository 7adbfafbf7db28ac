//! The bounded event queue both session managers keep, and the iterator that drains it.

use std::collections::vec_deque::IntoIter;
use std::collections::VecDeque;
use std::iter::FusedIterator;

use parking_lot::Mutex;

use crate::{ArenaEvent, MAX_EVENT_QUEUE_SIZE};

/// Events waiting for the game. Written from reactor threads and `update()`.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<ArenaEvent>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an event, discarding the oldest ones past [`MAX_EVENT_QUEUE_SIZE`].
    pub(crate) fn push(&self, event: ArenaEvent) {
        let mut queue = self.queue.lock();
        queue.push_back(event);
        while queue.len() > MAX_EVENT_QUEUE_SIZE {
            queue.pop_front();
        }
    }

    pub(crate) fn drain(&self) -> EventDrain {
        let taken = std::mem::take(&mut *self.queue.lock());
        EventDrain {
            inner: taken.into_iter(),
        }
    }
}

/// Owned iterator over the events a session collected since the last drain.
///
/// Obtain one from [`ArenaHost::events`](crate::ArenaHost::events) or
/// [`ArenaClient::events`](crate::ArenaClient::events). The queue is emptied up front, so
/// the iterator holds no lock.
///
/// ```ignore
/// for event in host.events() {
///     if let ArenaEvent::PlayerJoined { name, .. } = event {
///         println!("{name} joined");
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain {
    inner: IntoIter<ArenaEvent>,
}

impl Iterator for EventDrain {
    type Item = ArenaEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain {}

impl std::fmt::Debug for EventDrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
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
    use crate::ParticipantId;

    fn joined(id: u32) -> ArenaEvent {
        ArenaEvent::PlayerJoined {
            id: ParticipantId::new(id),
            name: format!("p{id}"),
        }
    }

    #[test]
    fn drain_yields_in_order_and_empties() {
        let queue = EventQueue::new();
        queue.push(joined(1));
        queue.push(joined(2));

        let events: Vec<_> = queue.drain().collect();
        assert_eq!(events, vec![joined(1), joined(2)]);
        assert_eq!(queue.drain().len(), 0);
    }

    #[test]
    fn oldest_events_are_discarded() {
        let queue = EventQueue::new();
        for id in 0..(MAX_EVENT_QUEUE_SIZE as u32 + 5) {
            queue.push(joined(id));
        }
        let mut drain = queue.drain();
        assert_eq!(drain.len(), MAX_EVENT_QUEUE_SIZE);
        assert_eq!(drain.next(), Some(joined(5)));
    }

    #[test]
    fn double_ended_and_fused() {
        let queue = EventQueue::new();
        queue.push(joined(1));
        queue.push(joined(2));
        let mut drain = queue.drain();
        assert_eq!(drain.next_back(), Some(joined(2)));
        assert_eq!(drain.next(), Some(joined(1)));
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }

    #[test]
    fn debug_shows_remaining_count() {
        let queue = EventQueue::new();
        queue.push(ArenaEvent::Disbanded);
        assert_eq!(format!("{:?}", queue.drain()), "EventDrain { remaining: 1 }");
    }
}
