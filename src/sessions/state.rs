//! Session state shared with the surrounding game.
//!
//! The game reads a [`SessionState`] every frame to draw the lobby, pick up the agreed chart
//! and seed, and drive the ruleset objects. Only the session managers write it. It lives
//! behind its own reader/writer lock, separate from the managers' roster lock.
//!
//! # Phases
//!
//! ```text
//!            host()/join()
//!   IDLE ──────────────────► LOBBY_OPEN ◄──────────────────────────────┐
//!                                │ chart proposed                      │
//!                                ▼                                     │
//!                        CHART_NEGOTIATION                             │
//!                                │ everyone ready on the host's chart  │
//!                                ▼                                     │
//!                             LOADING                                  │
//!                                │ all finished loading                │
//!                                ▼                                     │
//!                             PLAYING                                  │
//!                                │ all finished playing                │
//!                                ▼                                     │
//!                           RESULT_WAIT ──── all left results ─────────┘
//!
//!   any phase ── disband / leave / expiry ──► DISBANDED
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{ChartHash, ParticipantId, Ruleset};

/// A phase of the arena state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// No session.
    #[default]
    Idle,
    /// Lobby is accepting joins and no chart is under negotiation.
    LobbyOpen,
    /// A chart has been proposed; participants are confirming it.
    ChartNegotiation,
    /// Round started; waiting for everyone to finish loading.
    Loading,
    /// Round running; play data is streaming.
    Playing,
    /// Round finished; waiting for everyone to leave the result screen.
    ResultWait,
    /// Session closed. Terminal.
    Disbanded,
}

impl Phase {
    /// Returns `true` while the lobby accepts joins and chart proposals.
    #[must_use]
    pub const fn is_lobby(self) -> bool {
        matches!(self, Self::LobbyOpen | Self::ChartNegotiation)
    }

    /// Returns `true` for the phases between the round start and the result screen.
    #[must_use]
    pub const fn is_in_round(self) -> bool {
        matches!(self, Self::Loading | Self::Playing | Self::ResultWait)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "IDLE",
            Self::LobbyOpen => "LOBBY_OPEN",
            Self::ChartNegotiation => "CHART_NEGOTIATION",
            Self::Loading => "LOADING",
            Self::Playing => "PLAYING",
            Self::ResultWait => "RESULT_WAIT",
            Self::Disbanded => "DISBANDED",
        };
        f.write_str(text)
    }
}

/// What the game needs to know about one participant.
pub struct ParticipantSummary {
    /// Display name.
    pub name: String,
    /// Whether the participant is ready on the host's chart.
    pub ready: bool,
    /// The participant's gameplay object for the current round.
    ///
    /// For the local participant this is the live judge; for everyone else it is a mirror
    /// fed by relayed init and frame blobs.
    pub ruleset: Option<Box<dyn Ruleset>>,
}

impl ParticipantSummary {
    /// A summary for a participant who is not ready and has no ruleset yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: false,
            ruleset: None,
        }
    }
}

impl fmt::Debug for ParticipantSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            name,
            ready,
            ruleset,
        } = self;
        f.debug_struct("ParticipantSummary")
            .field("name", name)
            .field("ready", ready)
            .field("has_ruleset", &ruleset.is_some())
            .finish()
    }
}

/// Process-wide state of the active session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// A lobby is hosted or joined.
    pub online: bool,
    /// The session ended because the other side stopped answering.
    pub expired: bool,
    /// Current phase.
    pub phase: Phase,
    /// This instance's id, once assigned.
    pub local_id: Option<ParticipantId>,
    /// Participant ids in join order, host first.
    pub participants: Vec<ParticipantId>,
    /// Per-participant summary.
    pub summaries: BTreeMap<ParticipantId, ParticipantSummary>,
    /// The chart the most recent completed negotiation agreed on. Empty when none.
    ///
    /// A client's proposal can complete on a chart other than the host's selection. A round
    /// still starts only on the host's chart, once every client has confirmed it.
    pub chart: ChartHash,
    /// Shared note-layout seed for the current round.
    pub seed: u64,
    /// Delay, in milliseconds after the release of the loading barrier, at which play starts.
    pub start_delay_ms: Option<i64>,
    /// A round is in progress.
    pub playing: bool,
    /// The current round's play has ended and results are showing.
    pub playing_finished: bool,
}

impl SessionState {
    /// An empty, offline state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything to empty and offline. Leaves `expired` untouched.
    pub fn reset(&mut self) {
        let expired = self.expired;
        *self = Self {
            expired,
            ..Self::default()
        };
    }

    /// Adds a participant at the end of the join order.
    pub fn add_participant(&mut self, id: ParticipantId, name: impl Into<String>) {
        if !self.participants.contains(&id) {
            self.participants.push(id);
        }
        self.summaries.insert(id, ParticipantSummary::new(name));
    }

    /// Removes a participant, returning its summary.
    pub fn remove_participant(&mut self, id: ParticipantId) -> Option<ParticipantSummary> {
        self.participants.retain(|p| *p != id);
        self.summaries.remove(&id)
    }

    /// Number of participants, host included.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Display name of `id`.
    #[must_use]
    pub fn name_of(&self, id: ParticipantId) -> Option<&str> {
        self.summaries.get(&id).map(|s| s.name.as_str())
    }

    /// Readiness of every participant, in join order.
    #[must_use]
    pub fn ready_map(&self) -> Vec<(ParticipantId, bool)> {
        self.participants
            .iter()
            .map(|id| (*id, self.summaries.get(id).is_some_and(|s| s.ready)))
            .collect()
    }

    /// Sets the readiness of `id`. Returns `true` if it changed.
    pub fn set_ready(&mut self, id: ParticipantId, ready: bool) -> bool {
        match self.summaries.get_mut(&id) {
            Some(summary) if summary.ready != ready => {
                summary.ready = ready;
                true
            },
            _ => false,
        }
    }

    /// Clears every participant's readiness.
    pub fn clear_ready(&mut self) {
        for summary in self.summaries.values_mut() {
            summary.ready = false;
        }
    }

    /// Clears everything that belongs to one round: chart, seed, start time, flags, rulesets
    /// and readiness.
    pub fn clear_round(&mut self) {
        self.chart = ChartHash::empty();
        self.seed = 0;
        self.start_delay_ms = None;
        self.playing = false;
        self.playing_finished = false;
        for summary in self.summaries.values_mut() {
            summary.ready = false;
            summary.ruleset = None;
        }
    }

    /// The gameplay object of `id`, if one was created for the current round.
    pub fn ruleset_mut(&mut self, id: ParticipantId) -> Option<&mut (dyn Ruleset + 'static)> {
        self.summaries
            .get_mut(&id)
            .and_then(|s| s.ruleset.as_deref_mut())
    }

    /// The local participant's gameplay object.
    pub fn local_ruleset_mut(&mut self) -> Option<&mut (dyn Ruleset + 'static)> {
        let id = self.local_id?;
        self.ruleset_mut(id)
    }
}

/// Handle to the session state shared between the managers and the game.
pub type SharedState = Arc<RwLock<SessionState>>;

/// Creates a fresh, offline [`SharedState`].
#[must_use]
pub fn shared_state() -> SharedState {
    Arc::new(RwLock::new(SessionState::new()))
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

    struct Blob(Vec<u8>);

    impl Ruleset for Blob {
        fn pack_init(&self) -> Vec<u8> {
            self.0.clone()
        }
        fn unpack_init(&mut self, bytes: &[u8]) {
            self.0 = bytes.to_vec();
        }
        fn pack_frame(&self) -> Vec<u8> {
            self.0.clone()
        }
        fn unpack_frame(&mut self, bytes: &[u8]) {
            self.0 = bytes.to_vec();
        }
    }

    fn two_player_state() -> SessionState {
        let mut state = SessionState::new();
        state.online = true;
        state.add_participant(ParticipantId::HOST, "host");
        state.add_participant(ParticipantId::new(1), "rin");
        state
    }

    #[test]
    fn phase_display_uses_wire_style_names() {
        assert_eq!(Phase::ChartNegotiation.to_string(), "CHART_NEGOTIATION");
        assert_eq!(Phase::ResultWait.to_string(), "RESULT_WAIT");
    }

    #[test]
    fn phase_groups() {
        assert!(Phase::LobbyOpen.is_lobby());
        assert!(Phase::ChartNegotiation.is_lobby());
        assert!(!Phase::Loading.is_lobby());
        assert!(Phase::Playing.is_in_round());
        assert!(!Phase::Disbanded.is_in_round());
    }

    #[test]
    fn participants_keep_join_order() {
        let mut state = two_player_state();
        state.add_participant(ParticipantId::new(2), "mika");
        assert_eq!(
            state.participants,
            vec![
                ParticipantId::HOST,
                ParticipantId::new(1),
                ParticipantId::new(2)
            ]
        );
        state.remove_participant(ParticipantId::new(1));
        assert_eq!(
            state.participants,
            vec![ParticipantId::HOST, ParticipantId::new(2)]
        );
        assert_eq!(state.name_of(ParticipantId::new(2)), Some("mika"));
    }

    #[test]
    fn set_ready_reports_changes() {
        let mut state = two_player_state();
        assert!(state.set_ready(ParticipantId::new(1), true));
        assert!(!state.set_ready(ParticipantId::new(1), true));
        assert!(!state.set_ready(ParticipantId::new(9), true));
        assert_eq!(
            state.ready_map(),
            vec![(ParticipantId::HOST, false), (ParticipantId::new(1), true)]
        );
    }

    #[test]
    fn clear_round_drops_rulesets_and_flags() {
        let mut state = two_player_state();
        state.chart = ChartHash::new("abc");
        state.seed = 99;
        state.playing = true;
        state.start_delay_ms = Some(120);
        state.set_ready(ParticipantId::HOST, true);
        state.summaries.get_mut(&ParticipantId::HOST).unwrap().ruleset =
            Some(Box::new(Blob(vec![1])));

        state.clear_round();
        assert!(state.chart.is_empty());
        assert_eq!(state.seed, 0);
        assert!(!state.playing);
        assert_eq!(state.start_delay_ms, None);
        assert!(state.ruleset_mut(ParticipantId::HOST).is_none());
        assert!(state.ready_map().iter().all(|(_, ready)| !ready));
        assert_eq!(state.participant_count(), 2);
    }

    #[test]
    fn reset_keeps_expired_flag() {
        let mut state = two_player_state();
        state.expired = true;
        state.reset();
        assert!(state.expired);
        assert!(!state.online);
        assert_eq!(state.participant_count(), 0);
    }

    #[test]
    fn local_ruleset_is_reachable() {
        let mut state = two_player_state();
        state.local_id = Some(ParticipantId::new(1));
        state.summaries.get_mut(&ParticipantId::new(1)).unwrap().ruleset =
            Some(Box::new(Blob(vec![4, 2])));
        assert_eq!(state.local_ruleset_mut().unwrap().pack_frame(), vec![4, 2]);
    }
}
