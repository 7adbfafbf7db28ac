//! The host session manager.
//!
//! [`ArenaHost`] owns the authoritative roster and runs the round state machine described in
//! [`state`](crate::sessions::state). Reactor threads call into it with decoded messages;
//! the game calls [`ArenaHost::update`] once per frame for everything time-based.
//!
//! Locks are always taken in the order roster core, then [`SessionState`], then the event
//! queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};
use web_time::Instant;

use crate::clock::Clock;
use crate::network::codec::{decode_message, encode_message};
use crate::network::messages::{
    self, Ack, AckPayload, ChartProposal, ErrorCode, JoinRequest, LobbyAdvert, LobbyRoster,
    Message, MessageBody, MessageIndex, MessageKind, Notice, NoticeKey, PlayRelay, PlayerInfo,
    ReadyStat, StartPlaying, StartTime,
};
use crate::network::reactor::{MessageHandler, Reactor};
use crate::network::reliability::ReliableSender;
use crate::report_violation_to;
use crate::rng::random_seed;
use crate::sessions::builder::SessionParts;
use crate::sessions::config::{ArenaConfig, LocalIdentity};
use crate::sessions::event_drain::{EventDrain, EventQueue};
use crate::sessions::negotiation::{ConfirmOutcome, Negotiation, ProposalOutcome};
use crate::sessions::roster::{Participant, Roster};
use crate::sessions::state::{Phase, SessionState, SharedState};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    ArenaError, ArenaEvent, ChartHash, ChartStore, ParticipantId, RulesetFactory, Transport,
};

const HOST: ParticipantId = ParticipantId::HOST;

/// Why a participant left the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Left,
    TimedOut,
}

/// The host's own barrier signals for the current round.
#[derive(Debug, Default, Clone, Copy)]
struct HostRound {
    loading_offset_ms: Option<i64>,
    finished_playing: bool,
    finished_result: bool,
}

/// Everything guarded by the roster lock.
#[derive(Debug)]
struct HostCore {
    roster: Roster,
    negotiation: Negotiation,
    /// The chart the host is ready on. Empty when not ready.
    host_chart: ChartHash,
    round: HostRound,
    last_index: i32,
    closed: bool,
}

impl HostCore {
    fn next_index(&mut self) -> MessageIndex {
        self.last_index = self.last_index.wrapping_add(1);
        MessageIndex::new(self.last_index)
    }

    fn is_ready_on(&self, id: ParticipantId, chart: &ChartHash) -> bool {
        if id.is_host() {
            self.host_chart == *chart
        } else {
            self.roster
                .get(id)
                .is_some_and(|p| p.confirmed_chart == *chart)
        }
    }
}

struct HostInner {
    core: RwLock<HostCore>,
    state: SharedState,
    events: EventQueue,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: ArenaConfig,
    identity: LocalIdentity,
    chart_store: Arc<dyn ChartStore>,
    rulesets: Arc<dyn RulesetFactory>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

/// A hosted lobby.
///
/// Created by [`ArenaBuilder::host_on_port`](crate::ArenaBuilder::host_on_port) or
/// [`ArenaBuilder::host_with_transport`](crate::ArenaBuilder::host_with_transport).
/// Dropping the host disbands the lobby.
pub struct ArenaHost {
    inner: Arc<HostInner>,
    reactors: Mutex<Vec<Reactor>>,
}

impl ArenaHost {
    pub(crate) fn start(parts: SessionParts) -> Self {
        let SessionParts {
            config,
            identity,
            state,
            transport,
            clock,
            chart_store,
            rulesets,
            observer,
        } = parts;
        let inner = Arc::new(HostInner {
            core: RwLock::new(HostCore {
                roster: Roster::new(config.max_participants),
                negotiation: Negotiation::new(),
                host_chart: ChartHash::empty(),
                round: HostRound::default(),
                last_index: 0,
                closed: false,
            }),
            state,
            events: EventQueue::new(),
            transport,
            clock,
            config,
            identity,
            chart_store,
            rulesets,
            observer,
        });
        inner.open();
        Self {
            inner,
            reactors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn MessageHandler> {
        let handler: Arc<dyn MessageHandler> = self.inner.clone();
        handler
    }

    pub(crate) fn attach_reactor(&self, reactor: Reactor) {
        self.reactors.lock().push(reactor);
    }

    /// Runs retransmission, heartbeats, liveness sweeps, phase barriers and play-data
    /// fan-out. Call once per game frame.
    pub fn update(&self) {
        self.inner.update();
    }

    /// Drains the events collected since the last call. If more than
    /// [`MAX_EVENT_QUEUE_SIZE`](crate::MAX_EVENT_QUEUE_SIZE) accumulated, the oldest were
    /// discarded.
    pub fn events(&self) -> EventDrain {
        self.inner.events.drain()
    }

    /// Decodes and handles one datagram as if a reactor had received it.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        match decode_message(bytes) {
            Ok(msg) => self.inner.handle_message(from, msg),
            Err(e) => report_violation_to!(
                &self.inner.observer,
                ViolationSeverity::Warning,
                ViolationKind::Codec,
                "dropping {} byte datagram from {}: {}",
                bytes.len(),
                from,
                e
            ),
        }
    }

    /// Proposes `chart` as the host.
    ///
    /// A chart the host does not have produces a [`NoticeKey::HostLacksChart`] notice and
    /// changes nothing. Proposing a different chart than the host is ready on clears
    /// everyone's readiness. The empty hash withdraws the host's selection.
    pub fn select_chart(&self, chart: ChartHash) -> Result<(), ArenaError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.write();
        let phase = self.inner.require_online(&core)?;
        if !phase.is_lobby() {
            return Err(ArenaError::WrongPhase {
                expected: Phase::LobbyOpen,
                actual: phase,
            });
        }
        if chart.is_empty() {
            self.inner.reset_readiness(&mut core, &chart, now);
            core.negotiation.reset();
            self.inner.refresh_lobby_phase(&core);
            return Ok(());
        }
        if self.inner.propose(&mut core, HOST, &chart, now) == ProposalOutcome::HostLacksChart {
            self.inner.events.push(ArenaEvent::Notice(Notice::with_text(
                NoticeKey::HostLacksChart,
                chart.as_str(),
            )));
        }
        Ok(())
    }

    /// Signals that the host finished loading and intends to start `start_offset_ms` after
    /// the loading barrier releases.
    pub fn finish_loading(&self, start_offset_ms: i64) -> Result<(), ArenaError> {
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::Loading)?;
        core.round.loading_offset_ms = Some(start_offset_ms);
        Ok(())
    }

    /// Signals that the host finished playing.
    pub fn finish_playing(&self) -> Result<(), ArenaError> {
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::Playing)?;
        core.round.finished_playing = true;
        Ok(())
    }

    /// Signals that the host left the result screen.
    pub fn finish_result(&self) -> Result<(), ArenaError> {
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::ResultWait)?;
        core.round.finished_result = true;
        Ok(())
    }

    /// Tells every client the lobby is closed and stops listening. Idempotent.
    pub fn disband(&self) {
        if !self.inner.close() {
            return;
        }
        let mut reactors = std::mem::take(&mut *self.reactors.lock());
        for reactor in &mut reactors {
            reactor.stop();
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.state.read().phase
    }

    /// The state shared with the game.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.inner.state)
    }

    /// The configuration this host runs with.
    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.inner.config
    }

    /// Returns `true` until the lobby is disbanded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.core.read().closed
    }

    /// Addresses the reactor threads listen on.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.reactors
            .lock()
            .iter()
            .filter_map(Reactor::local_addr)
            .collect()
    }

    /// Client ids in order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ParticipantId> {
        self.inner.core.read().roster.ids()
    }

    /// The latest round-trip estimate for a client.
    #[must_use]
    pub fn participant_rtt(&self, id: ParticipantId) -> Option<Duration> {
        self.inner.core.read().roster.get(id).map(|p| p.rtt)
    }

    /// Number of messages to `id` still awaiting acknowledgment.
    #[must_use]
    pub fn pending_sends(&self, id: ParticipantId) -> usize {
        self.inner
            .core
            .read()
            .roster
            .get(id)
            .map_or(0, |p| p.sender.len())
    }
}

impl Drop for ArenaHost {
    fn drop(&mut self) {
        self.disband();
    }
}

impl fmt::Debug for ArenaHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.read();
        f.debug_struct("ArenaHost")
            .field("name", &self.inner.identity.name)
            .field("phase", &self.inner.state.read().phase)
            .field("clients", &core.roster.ids())
            .field("closed", &core.closed)
            .finish_non_exhaustive()
    }
}

impl MessageHandler for HostInner {
    fn handle_message(&self, from: SocketAddr, msg: Message) {
        let now = self.clock.now();
        let mut core = self.core.write();
        if core.closed {
            return;
        }
        let Message { index, body } = msg;
        match body {
            MessageBody::SeekLobby => self.advertise(from),
            MessageBody::JoinLobby(request) => self.on_join(&mut core, from, index, request, now),
            body => self.on_member_message(&mut core, from, index, body, now),
        }
    }
}

impl HostInner {
    fn open(&self) {
        let mut state = self.state.write();
        state.reset();
        state.expired = false;
        state.online = true;
        state.local_id = Some(HOST);
        state.add_participant(HOST, self.identity.name.clone());
        self.set_phase(&mut state, Phase::LobbyOpen);
        info!(name = %self.identity.name, port = self.config.port, "lobby open");
    }

    /// Returns `false` if the lobby was already closed.
    fn close(&self) -> bool {
        let now = self.clock.now();
        let mut core = self.core.write();
        if core.closed {
            return false;
        }
        self.broadcast(&mut core, &MessageBody::DisbandLobby, None, now);
        core.closed = true;
        for participant in core.roster.iter_mut() {
            participant.sender.clear();
        }
        {
            let mut state = self.state.write();
            self.set_phase(&mut state, Phase::Disbanded);
            state.reset();
            state.phase = Phase::Disbanded;
        }
        self.events.push(ArenaEvent::Disbanded);
        info!("lobby disbanded");
        true
    }

    fn require_online(&self, core: &HostCore) -> Result<Phase, ArenaError> {
        let state = self.state.read();
        if core.closed || !state.online {
            return Err(ArenaError::NotOnline);
        }
        Ok(state.phase)
    }

    fn require_phase(&self, core: &HostCore, expected: Phase) -> Result<(), ArenaError> {
        let actual = self.require_online(core)?;
        if actual != expected {
            return Err(ArenaError::WrongPhase { expected, actual });
        }
        Ok(())
    }

    fn phase(&self) -> Phase {
        self.state.read().phase
    }

    fn set_phase(&self, state: &mut SessionState, to: Phase) {
        let from = state.phase;
        if from == to {
            return;
        }
        state.phase = to;
        debug!(%from, %to, "host phase changed");
        self.events.push(ArenaEvent::PhaseChanged { from, to });
    }

    /// Sends a tracked (or fire-and-forget) message to one client.
    fn send(&self, core: &mut HostCore, to: ParticipantId, body: MessageBody, now: Instant) {
        let index = core.next_index();
        let Some(participant) = core.roster.get_mut(to) else {
            return;
        };
        let msg = Message::new(index, body);
        if let Err(e) = participant
            .sender
            .send(self.transport.as_ref(), &msg, now)
        {
            report_violation_to!(
                &self.observer,
                participant = to,
                ViolationSeverity::Error,
                ViolationKind::Codec,
                "could not encode {} for participant {}: {}",
                msg.kind(),
                to,
                e
            );
        }
    }

    fn broadcast(
        &self,
        core: &mut HostCore,
        body: &MessageBody,
        except: Option<ParticipantId>,
        now: Instant,
    ) {
        for id in core.roster.ids() {
            if Some(id) != except {
                self.send(core, id, body.clone(), now);
            }
        }
    }

    /// Answers `index` from `to` outside any reliability table.
    fn reply(&self, to: SocketAddr, index: MessageIndex, ack: Ack) {
        let msg = Message::new(index, MessageBody::Ack(ack));
        match encode_message(&msg) {
            Ok(bytes) => self.transport.send_to(&bytes, to),
            Err(e) => report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Codec,
                "could not encode ack for {}: {}",
                to,
                e
            ),
        }
    }

    fn advertise(&self, to: SocketAddr) {
        let advert = MessageBody::SeekLobbyReply(LobbyAdvert {
            name: self.identity.name.clone(),
            port: self.config.port,
        });
        match encode_message(&Message::new(MessageIndex::new(0), advert)) {
            Ok(bytes) => self.transport.send_to(&bytes, to),
            Err(e) => report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Codec,
                "could not encode lobby advert: {}",
                e
            ),
        }
    }

    /// Delivers a notice to `to`: an event for the host, a wire notice for a client.
    fn notify(&self, core: &mut HostCore, to: ParticipantId, notice: Notice, now: Instant) {
        if to.is_host() {
            self.events.push(ArenaEvent::Notice(notice));
        } else {
            self.send(core, to, MessageBody::Notice(notice), now);
        }
    }

    fn on_join(
        &self,
        core: &mut HostCore,
        from: SocketAddr,
        index: MessageIndex,
        request: JoinRequest,
        now: Instant,
    ) {
        if let Some(id) = core.roster.id_by_addr(&from) {
            // A lost join answer makes the client resend the identical request.
            let retransmit = core
                .roster
                .get(id)
                .is_some_and(|p| p.join_index == index && p.name == request.name);
            if retransmit {
                let roster = roster_for(&self.state.read(), id);
                self.reply(from, index, join_ack(roster));
            } else {
                self.reject_join(from, index, ErrorCode::DuplicateAddress);
            }
            return;
        }

        let code = {
            let state = self.state.read();
            if state.playing || state.phase.is_in_round() {
                ErrorCode::HostIsPlaying
            } else if request.version != self.identity.version {
                ErrorCode::VersionMismatch
            } else if core.roster.is_full() {
                ErrorCode::LobbyFull
            } else {
                ErrorCode::Ok
            }
        };
        if !code.is_ok() {
            self.reject_join(from, index, code);
            return;
        }

        let name = request.name;
        let sender = ReliableSender::new(from, self.config.retry_interval, self.config.max_retries);
        let id = core.roster.insert(name.clone(), from, sender, now);
        if let Some(participant) = core.roster.get_mut(id) {
            participant.filter.accept(index);
            participant.join_index = index;
        }
        let roster = {
            let mut state = self.state.write();
            state.add_participant(id, name.clone());
            roster_for(&state, id)
        };

        self.broadcast(
            core,
            &MessageBody::PlayerJoined(PlayerInfo {
                id,
                name: name.clone(),
            }),
            Some(id),
            now,
        );
        self.reply(from, index, join_ack(roster));
        self.catch_up(core, id, now);

        info!(%id, %name, %from, "participant joined");
        self.events.push(ArenaEvent::PlayerJoined {
            id,
            name: name.clone(),
        });
        self.events.push(ArenaEvent::Notice(Notice::with_text(
            NoticeKey::PlayerJoined,
            name,
        )));
    }

    fn reject_join(&self, from: SocketAddr, index: MessageIndex, code: ErrorCode) {
        info!(%from, %code, "join rejected");
        self.reply(from, index, Ack::rejected(MessageKind::JoinLobby, code));
    }

    /// Brings a newcomer up to date with the lobby's negotiation state.
    fn catch_up(&self, core: &mut HostCore, id: ParticipantId, now: Instant) {
        if !core.host_chart.is_empty() {
            let chart = core.host_chart.clone();
            self.send(
                core,
                id,
                MessageBody::HostRequestChart(ChartProposal { chart }),
                now,
            );
        }
        let ready = self.state.read().ready_map();
        if ready.iter().any(|(_, ready)| *ready) {
            self.send(core, id, MessageBody::HostReadyStat(ReadyStat { ready }), now);
        }
        let pending = core.negotiation.pending().clone();
        if !pending.is_empty() {
            self.send(
                core,
                id,
                MessageBody::CheckChartExist(ChartProposal { chart: pending }),
                now,
            );
        }
    }

    fn on_member_message(
        &self,
        core: &mut HostCore,
        from: SocketAddr,
        index: MessageIndex,
        body: MessageBody,
        now: Instant,
    ) {
        let kind = body.kind();
        let Some(id) = core.roster.id_by_addr(&from) else {
            debug!(%kind, %from, "message from a non-participant");
            if kind.wants_ack() {
                self.reply(from, index, Ack::rejected(kind, ErrorCode::NotInLobby));
            }
            return;
        };
        let body = match body {
            MessageBody::Ack(ack) => return self.on_ack(core, id, index, ack, now),
            other => other,
        };

        if kind == MessageKind::ClientPlayData {
            let newest = core
                .roster
                .get_mut(id)
                .is_some_and(|p| p.play_filter.accept(index));
            if newest {
                self.dispatch(core, id, body, now);
            } else {
                trace!(%id, %index, "superseded play data");
            }
            return;
        }

        let fresh = core
            .roster
            .get_mut(id)
            .is_some_and(|p| p.filter.accept(index));
        if !fresh {
            // Already handled; answer again so the sender stops retrying.
            trace!(%id, %kind, %index, "duplicate message");
            if kind.wants_ack() {
                self.reply(from, index, Ack::ok(kind));
            }
            return;
        }

        let code = self.dispatch(core, id, body, now);
        if kind.wants_ack() {
            self.reply(from, index, Ack::rejected(kind, code));
        }
    }

    fn dispatch(
        &self,
        core: &mut HostCore,
        id: ParticipantId,
        body: MessageBody,
        now: Instant,
    ) -> ErrorCode {
        let phase = self.phase();
        match body {
            MessageBody::LeaveLobby => {
                self.remove_participant(core, id, Departure::Left, now);
                ErrorCode::Ok
            },
            MessageBody::Heartbeat | MessageBody::Notice(_) => ErrorCode::Ok,
            MessageBody::ClientRequestChart(proposal) => {
                if !phase.is_lobby() {
                    return self.wrong_phase(id, MessageKind::ClientRequestChart, phase);
                }
                self.on_client_proposal(core, id, &proposal.chart, now)
            },
            MessageBody::ClientPlayInit(blob) => {
                if phase != Phase::Loading {
                    return self.wrong_phase(id, MessageKind::ClientPlayInit, phase);
                }
                if let Some(participant) = core.roster.get_mut(id) {
                    participant.init_blob = Some(blob.data);
                }
                ErrorCode::Ok
            },
            MessageBody::ClientFinishedLoading(loading) => {
                if phase != Phase::Loading {
                    return self.wrong_phase(id, MessageKind::ClientFinishedLoading, phase);
                }
                if let Some(participant) = core.roster.get_mut(id) {
                    participant.loading_offset_ms = Some(loading.start_offset_ms);
                }
                ErrorCode::Ok
            },
            MessageBody::ClientPlayData(blob) => {
                if phase == Phase::Playing {
                    if let Some(participant) = core.roster.get_mut(id) {
                        participant.latest_frame = Some(blob.data);
                    }
                }
                ErrorCode::Ok
            },
            MessageBody::ClientFinishedPlaying => {
                if phase != Phase::Playing {
                    return self.wrong_phase(id, MessageKind::ClientFinishedPlaying, phase);
                }
                if let Some(participant) = core.roster.get_mut(id) {
                    participant.finished_playing = true;
                }
                ErrorCode::Ok
            },
            MessageBody::ClientFinishedResult => {
                if phase != Phase::ResultWait {
                    return self.wrong_phase(id, MessageKind::ClientFinishedResult, phase);
                }
                if let Some(participant) = core.roster.get_mut(id) {
                    participant.finished_result = true;
                }
                ErrorCode::Ok
            },
            other => {
                report_violation_to!(
                    &self.observer,
                    participant = id,
                    ViolationSeverity::Warning,
                    ViolationKind::Roster,
                    "participant {} sent {}, which only a host sends",
                    id,
                    other.kind()
                );
                ErrorCode::WrongPhase
            },
        }
    }

    fn wrong_phase(&self, id: ParticipantId, kind: MessageKind, phase: Phase) -> ErrorCode {
        report_violation_to!(
            &self.observer,
            participant = id,
            ViolationSeverity::Warning,
            ViolationKind::PhaseBarrier,
            "participant {} sent {} during {}",
            id,
            kind,
            phase
        );
        ErrorCode::WrongPhase
    }

    fn on_client_proposal(
        &self,
        core: &mut HostCore,
        id: ParticipantId,
        chart: &ChartHash,
        now: Instant,
    ) -> ErrorCode {
        if chart.is_empty() {
            // Withdraws the client's readiness.
            if let Some(participant) = core.roster.get_mut(id) {
                participant.confirmed_chart = ChartHash::empty();
            }
            let changed = self.state.write().set_ready(id, false);
            if changed {
                self.broadcast_ready(core, now);
            }
            return ErrorCode::Ok;
        }
        match self.propose(core, id, chart, now) {
            ProposalOutcome::HostLacksChart => {
                debug!(%id, %chart, "client proposed a chart the host lacks");
                ErrorCode::ChartMissing
            },
            ProposalOutcome::Completed | ProposalOutcome::AwaitConfirmations => ErrorCode::Ok,
        }
    }

    fn propose(
        &self,
        core: &mut HostCore,
        proposer: ParticipantId,
        chart: &ChartHash,
        now: Instant,
    ) -> ProposalOutcome {
        let host_has_chart = self.chart_store.has_chart(chart);
        // Only the host's own change of mind resets everyone; a client's new proposal
        // just restarts the confirmation count.
        if proposer.is_host() && host_has_chart && *chart != core.host_chart {
            self.reset_readiness(core, chart, now);
        }
        let clients = core.roster.len();
        let outcome = core
            .negotiation
            .propose(proposer, chart, host_has_chart, clients);
        debug!(%proposer, %chart, ?outcome, "chart proposed");
        match outcome {
            ProposalOutcome::HostLacksChart => {},
            ProposalOutcome::Completed => self.complete_negotiation(core, proposer, now),
            ProposalOutcome::AwaitConfirmations => {
                let check = MessageBody::CheckChartExist(ChartProposal {
                    chart: chart.clone(),
                });
                for id in core.roster.ids() {
                    if id != proposer && !core.negotiation.has_confirmed(id) {
                        self.send(core, id, check.clone(), now);
                    }
                }
            },
        }
        self.refresh_lobby_phase(core);
        outcome
    }

    /// Clears every participant's readiness and tells clients which chart is now selected.
    fn reset_readiness(&self, core: &mut HostCore, chart: &ChartHash, now: Instant) {
        core.host_chart = ChartHash::empty();
        for participant in core.roster.iter_mut() {
            participant.confirmed_chart = ChartHash::empty();
        }
        {
            let mut state = self.state.write();
            state.clear_ready();
            state.chart = ChartHash::empty();
        }
        self.broadcast(
            core,
            &MessageBody::HostRequestChart(ChartProposal {
                chart: chart.clone(),
            }),
            None,
            now,
        );
        self.broadcast_ready(core, now);
    }

    fn broadcast_ready(&self, core: &mut HostCore, now: Instant) {
        let ready = self.state.read().ready_map();
        self.broadcast(
            core,
            &MessageBody::HostReadyStat(ReadyStat {
                ready: ready.clone(),
            }),
            None,
            now,
        );
        self.events.push(ArenaEvent::ReadyChanged { ready });
    }

    fn complete_negotiation(&self, core: &mut HostCore, proposer: ParticipantId, now: Instant) {
        let chart = core.negotiation.pending().clone();
        if proposer.is_host() {
            core.host_chart = chart.clone();
        } else if let Some(participant) = core.roster.get_mut(proposer) {
            participant.confirmed_chart = chart.clone();
        } else {
            core.negotiation.reset();
            return;
        }
        if !proposer.is_host() && !core.host_chart.is_empty() && core.host_chart != chart {
            debug!(
                %proposer,
                %chart,
                host_chart = %core.host_chart,
                "agreed on a chart the host did not select"
            );
            let notice =
                Notice::with_text(NoticeKey::HostSelectedOtherChart, core.host_chart.as_str());
            self.notify(core, proposer, notice, now);
        }
        {
            let mut state = self.state.write();
            state.chart = chart.clone();
            state.set_ready(proposer, true);
        }
        info!(%proposer, %chart, "chart agreed");
        self.events.push(ArenaEvent::ChartSelected { chart });
        self.broadcast_ready(core, now);
    }

    fn refresh_lobby_phase(&self, core: &HostCore) {
        let mut state = self.state.write();
        if !state.phase.is_lobby() {
            return;
        }
        let to = if core.negotiation.pending().is_empty() && core.host_chart.is_empty() {
            Phase::LobbyOpen
        } else {
            Phase::ChartNegotiation
        };
        self.set_phase(&mut state, to);
    }

    fn on_ack(
        &self,
        core: &mut HostCore,
        id: ParticipantId,
        index: MessageIndex,
        ack: Ack,
        now: Instant,
    ) {
        let Some(participant) = core.roster.get_mut(id) else {
            return;
        };
        let Some(entry) = participant.sender.on_ack(index) else {
            trace!(%id, %index, "ack for nothing in flight");
            return;
        };
        if entry.kind != ack.req_kind {
            report_violation_to!(
                &self.observer,
                participant = id,
                ViolationSeverity::Warning,
                ViolationKind::Reliability,
                "participant {} acknowledged {} {} as {}",
                id,
                entry.kind,
                index,
                ack.req_kind
            );
        }
        if !ack.error.is_ok() {
            debug!(%id, kind = %entry.kind, code = %ack.error, "participant refused a message");
        }
        match entry.kind {
            MessageKind::Heartbeat => {
                participant.rtt = now.saturating_duration_since(entry.sent_at);
                participant.last_heartbeat = now;
                trace!(%id, rtt = ?participant.rtt, "heartbeat acknowledged");
            },
            MessageKind::CheckChartExist => {
                let exist = matches!(ack.payload, AckPayload::ChartExist { exist: true });
                let chart = match decode_message(entry.bytes()) {
                    Ok(Message {
                        body: MessageBody::CheckChartExist(proposal),
                        ..
                    }) => proposal.chart,
                    _ => return,
                };
                self.on_chart_answer(core, id, &chart, exist, now);
            },
            _ => {},
        }
    }

    fn on_chart_answer(
        &self,
        core: &mut HostCore,
        id: ParticipantId,
        chart: &ChartHash,
        exist: bool,
        now: Instant,
    ) {
        let clients = core.roster.len();
        match core.negotiation.confirm(id, chart, exist, clients) {
            ConfirmOutcome::Stale | ConfirmOutcome::Waiting => {},
            ConfirmOutcome::Missing { proposer } => {
                let name = self.state.read().name_of(id).unwrap_or_default().to_owned();
                debug!(%id, %chart, "participant lacks the proposed chart");
                self.notify(
                    core,
                    proposer,
                    Notice::with_text(NoticeKey::PeerLacksChart, name),
                    now,
                );
            },
            ConfirmOutcome::Completed { proposer } => {
                self.complete_negotiation(core, proposer, now);
            },
        }
    }

    fn remove_participant(
        &self,
        core: &mut HostCore,
        id: ParticipantId,
        why: Departure,
        now: Instant,
    ) {
        let Some(gone) = core.roster.remove(id) else {
            return;
        };
        core.negotiation.forget(id);
        self.state.write().remove_participant(id);
        self.broadcast(
            core,
            &MessageBody::PlayerLeft(messages::PlayerLeft { id }),
            None,
            now,
        );

        let key = match why {
            Departure::Left => NoticeKey::PlayerLeft,
            Departure::TimedOut => NoticeKey::PlayerTimedOut,
        };
        info!(%id, name = %gone.name, ?why, "participant removed");
        self.events.push(ArenaEvent::PlayerLeft {
            id,
            name: gone.name.clone(),
        });
        self.events
            .push(ArenaEvent::Notice(Notice::with_text(key, gone.name)));

        // A departure can leave the pending proposal either orphaned or complete.
        if self.phase().is_lobby() {
            if core.negotiation.proposer() == Some(id) {
                core.negotiation.reset();
            } else if let Some(proposer) = core.negotiation.completes_with(core.roster.len()) {
                let pending = core.negotiation.pending().clone();
                if !core.is_ready_on(proposer, &pending) {
                    self.complete_negotiation(core, proposer, now);
                }
            }
            self.refresh_lobby_phase(core);
        }
    }

    fn update(&self) {
        let now = self.clock.now();
        let mut core = self.core.write();
        if core.closed {
            return;
        }
        self.sweep(&mut core, now);
        self.send_heartbeats(&mut core, now);
        match self.phase() {
            Phase::LobbyOpen | Phase::ChartNegotiation => self.try_start_round(&mut core, now),
            Phase::Loading => self.try_release_loading(&mut core, now),
            Phase::Playing => {
                self.fan_out_play_data(&mut core, now);
                self.try_finish_playing(&mut core, now);
            },
            Phase::ResultWait => self.try_finish_results(&mut core, now),
            Phase::Idle | Phase::Disbanded => {},
        }
    }

    /// Retransmits, then removes every client that ran out of retries or stopped
    /// answering heartbeats.
    fn sweep(&self, core: &mut HostCore, now: Instant) {
        let mut dead = Vec::new();
        for participant in core.roster.iter_mut() {
            let expired = participant.sender.tick(self.transport.as_ref(), now);
            if let Some(first) = expired.first() {
                report_violation_to!(
                    &self.observer,
                    participant = participant.id,
                    ViolationSeverity::Warning,
                    ViolationKind::Reliability,
                    "participant {} never acknowledged {} {}",
                    participant.id,
                    first.kind,
                    first.index
                );
                participant.alive = false;
            } else if now.saturating_duration_since(participant.last_heartbeat)
                > self.config.liveness_timeout
            {
                debug!(id = %participant.id, "participant stopped answering heartbeats");
                participant.alive = false;
            }
            if !participant.alive {
                dead.push(participant.id);
            }
        }
        for id in dead {
            self.remove_participant(core, id, Departure::TimedOut, now);
        }
    }

    fn send_heartbeats(&self, core: &mut HostCore, now: Instant) {
        for id in core.roster.ids() {
            let due = core.roster.get_mut(id).is_some_and(|p| {
                let due = !p.sender.has_pending_kind(MessageKind::Heartbeat)
                    && now.saturating_duration_since(p.last_heartbeat_sent)
                        >= self.config.heartbeat_interval;
                if due {
                    p.last_heartbeat_sent = now;
                }
                due
            });
            if due {
                self.send(core, id, MessageBody::Heartbeat, now);
            }
        }
    }

    fn try_start_round(&self, core: &mut HostCore, now: Instant) {
        if core.host_chart.is_empty()
            || !core
                .roster
                .iter()
                .all(|p| p.confirmed_chart == core.host_chart)
        {
            return;
        }
        let seed = random_seed();
        let chart = core.host_chart.clone();
        self.broadcast(
            core,
            &MessageBody::HostStartPlaying(StartPlaying {
                seed,
                chart: chart.clone(),
            }),
            None,
            now,
        );
        core.negotiation.reset();
        core.round = HostRound::default();
        {
            let mut state = self.state.write();
            state.chart = chart.clone();
            state.seed = seed;
            state.playing = true;
            state.playing_finished = false;
            state.start_delay_ms = None;
            for id in state.participants.clone() {
                let ruleset = self.rulesets.create(id, seed, &chart);
                if let Some(summary) = state.summaries.get_mut(&id) {
                    summary.ruleset = Some(ruleset);
                }
            }
            self.set_phase(&mut state, Phase::Loading);
        }
        info!(seed, %chart, "round started");
        self.events.push(ArenaEvent::StartPlaying { seed, chart });
    }

    fn try_release_loading(&self, core: &mut HostCore, now: Instant) {
        let Some(host_offset) = core.round.loading_offset_ms else {
            return;
        };
        let mut canonical = host_offset;
        for participant in core.roster.iter() {
            let Some(offset) = participant.loading_offset_ms else {
                return;
            };
            canonical = canonical.max(offset + participant.half_rtt_ms());
        }

        let mut inits = Vec::with_capacity(core.roster.len() + 1);
        {
            let mut state = self.state.write();
            if let Some(own) = state.ruleset_mut(HOST) {
                inits.push((HOST, own.pack_init()));
            }
            for participant in core.roster.iter() {
                if let Some(blob) = &participant.init_blob {
                    if let Some(mirror) = state.ruleset_mut(participant.id) {
                        mirror.unpack_init(blob);
                    }
                    inits.push((participant.id, blob.clone()));
                }
            }
        }
        self.broadcast(
            core,
            &MessageBody::HostPlayInit(PlayRelay { entries: inits }),
            None,
            now,
        );
        for id in core.roster.ids() {
            let half_rtt = core.roster.get(id).map_or(0, Participant::half_rtt_ms);
            self.send(
                core,
                id,
                MessageBody::HostFinishedLoading(StartTime {
                    start_ms: canonical - half_rtt,
                }),
                now,
            );
        }
        {
            let mut state = self.state.write();
            state.start_delay_ms = Some(canonical);
            self.set_phase(&mut state, Phase::Playing);
        }
        info!(start_ms = canonical, "loading barrier released");
        self.events
            .push(ArenaEvent::StartTimeDecided { start_ms: canonical });
    }

    /// Relays each frame received since the last update, plus the host's own, to every
    /// client except its author.
    fn fan_out_play_data(&self, core: &mut HostCore, now: Instant) {
        let mut frames = Vec::with_capacity(core.roster.len() + 1);
        {
            let mut state = self.state.write();
            if let Some(own) = state.ruleset_mut(HOST) {
                frames.push((HOST, own.pack_frame()));
            }
            for participant in core.roster.iter_mut() {
                if let Some(frame) = participant.latest_frame.take() {
                    if let Some(mirror) = state.ruleset_mut(participant.id) {
                        mirror.unpack_frame(&frame);
                    }
                    frames.push((participant.id, frame));
                }
            }
        }
        if frames.is_empty() {
            return;
        }
        for id in core.roster.ids() {
            let entries: Vec<_> = frames
                .iter()
                .filter(|(author, _)| *author != id)
                .cloned()
                .collect();
            if !entries.is_empty() {
                self.send(core, id, MessageBody::HostPlayData(PlayRelay { entries }), now);
            }
        }
    }

    fn try_finish_playing(&self, core: &mut HostCore, now: Instant) {
        if !core.round.finished_playing || !core.roster.iter().all(|p| p.finished_playing) {
            return;
        }
        self.broadcast(core, &MessageBody::HostFinishedPlaying, None, now);
        let mut state = self.state.write();
        state.playing_finished = true;
        self.set_phase(&mut state, Phase::ResultWait);
        info!("playing barrier released");
    }

    fn try_finish_results(&self, core: &mut HostCore, now: Instant) {
        if !core.round.finished_result || !core.roster.iter().all(|p| p.finished_result) {
            return;
        }
        self.broadcast(core, &MessageBody::HostFinishedResult, None, now);
        for participant in core.roster.iter_mut() {
            participant.clear_round();
        }
        core.host_chart = ChartHash::empty();
        core.round = HostRound::default();
        core.negotiation.reset();
        let ready = {
            let mut state = self.state.write();
            state.clear_round();
            self.set_phase(&mut state, Phase::LobbyOpen);
            state.ready_map()
        };
        info!("round finished");
        self.events.push(ArenaEvent::ReadyChanged { ready });
    }
}

fn join_ack(roster: LobbyRoster) -> Ack {
    Ack {
        req_kind: MessageKind::JoinLobby,
        error: ErrorCode::Ok,
        payload: AckPayload::Roster(roster),
    }
}

fn roster_for(state: &SessionState, your_id: ParticipantId) -> LobbyRoster {
    LobbyRoster {
        your_id,
        members: state
            .participants
            .iter()
            .map(|id| PlayerInfo {
                id: *id,
                name: state.name_of(*id).unwrap_or_default().to_owned(),
            })
            .collect(),
    }
}
