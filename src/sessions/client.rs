//! The client session manager.
//!
//! [`ArenaClient`] mirrors the host's phase machine from a single participant's point of
//! view. It never decides anything on its own: every phase change is a reaction to a `Host*`
//! message. It does watch its own liveness; when the host stops sending heartbeats, or stops
//! acknowledging, the session is marked expired.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};
use web_time::Instant;

use crate::clock::Clock;
use crate::network::codec::{decode_message, encode_message};
use crate::network::messages::{
    Ack, AckPayload, ChartProposal, ErrorCode, FinishedLoading, JoinRequest, Message,
    MessageBody, MessageIndex, MessageKind, Notice, NoticeKey, PlayBlob,
};
use crate::network::reactor::{MessageHandler, Reactor};
use crate::network::reliability::{DuplicateFilter, RecencyFilter, ReliableSender};
use crate::report_violation_to;
use crate::sessions::builder::SessionParts;
use crate::sessions::config::{ArenaConfig, LocalIdentity};
use crate::sessions::event_drain::{EventDrain, EventQueue};
use crate::sessions::state::{Phase, SessionState, SharedState};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    ArenaError, ArenaEvent, ChartHash, ChartStore, ParticipantId, RulesetFactory, Transport,
};

/// How often [`ArenaClient::wait_for_join`] polls.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Progress of the join handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// Waiting for the host's answer.
    Pending,
    /// The host admitted us.
    Accepted,
    /// The host refused.
    Rejected(ErrorCode),
    /// The host never answered.
    TimedOut,
}

#[derive(Debug)]
struct ClientCore {
    sender: ReliableSender,
    filter: DuplicateFilter,
    play_filter: RecencyFilter,
    status: JoinStatus,
    join_started: Instant,
    last_heartbeat: Instant,
    last_index: i32,
    closed: bool,
}

impl ClientCore {
    fn next_index(&mut self) -> MessageIndex {
        self.last_index = self.last_index.wrapping_add(1);
        MessageIndex::new(self.last_index)
    }
}

struct ClientInner {
    host: SocketAddr,
    core: RwLock<ClientCore>,
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

/// A joined (or joining) lobby.
///
/// Created by [`ArenaBuilder::join`](crate::ArenaBuilder::join) or
/// [`ArenaBuilder::join_with_transport`](crate::ArenaBuilder::join_with_transport).
/// Dropping the client leaves the lobby.
pub struct ArenaClient {
    inner: Arc<ClientInner>,
    reactor: Mutex<Option<Reactor>>,
}

impl ArenaClient {
    /// Sends the join request. The answer arrives asynchronously; see
    /// [`join_status`](Self::join_status).
    pub(crate) fn connect(parts: SessionParts, host: SocketAddr) -> Self {
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
        let now = clock.now();
        let inner = Arc::new(ClientInner {
            host,
            core: RwLock::new(ClientCore {
                sender: ReliableSender::new(host, config.retry_interval, config.max_retries),
                filter: DuplicateFilter::new(),
                play_filter: RecencyFilter::new(),
                status: JoinStatus::Pending,
                join_started: now,
                last_heartbeat: now,
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
        inner.begin_join(now);
        Self {
            inner,
            reactor: Mutex::new(None),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn MessageHandler> {
        let handler: Arc<dyn MessageHandler> = self.inner.clone();
        handler
    }

    pub(crate) fn attach_reactor(&self, reactor: Reactor) {
        *self.reactor.lock() = Some(reactor);
    }

    /// Blocks, polling [`update`](Self::update), until the host answers or the join timeout
    /// elapses.
    pub fn wait_for_join(&self) -> Result<(), ArenaError> {
        let deadline = Instant::now() + self.inner.config.join_timeout;
        loop {
            self.update();
            match self.join_status() {
                JoinStatus::Accepted => return Ok(()),
                JoinStatus::Rejected(code) => return Err(ArenaError::JoinRejected { code }),
                JoinStatus::TimedOut => return Err(ArenaError::JoinTimedOut),
                JoinStatus::Pending => {},
            }
            if Instant::now() >= deadline {
                self.inner.time_out_join(&mut self.inner.core.write());
                return Err(ArenaError::JoinTimedOut);
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    /// Progress of the join handshake.
    #[must_use]
    pub fn join_status(&self) -> JoinStatus {
        self.inner.core.read().status
    }

    /// Runs retransmission, the join timeout, the liveness check and play-data streaming.
    /// Call once per game frame.
    pub fn update(&self) {
        self.inner.update();
    }

    /// Drains the events collected since the last call.
    pub fn events(&self) -> EventDrain {
        self.inner.events.drain()
    }

    /// Decodes and handles one datagram as if the reactor had received it.
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

    /// Proposes `chart` to the host. The empty hash withdraws our readiness.
    ///
    /// A chart missing from the local library produces a
    /// [`NoticeKey::ChartMissingLocally`] notice and sends nothing.
    pub fn request_chart(&self, chart: ChartHash) -> Result<(), ArenaError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.write();
        let phase = self.inner.require_online(&core)?;
        if !phase.is_lobby() {
            return Err(ArenaError::WrongPhase {
                expected: Phase::LobbyOpen,
                actual: phase,
            });
        }
        if !chart.is_empty() && !self.inner.chart_store.has_chart(&chart) {
            self.inner.events.push(ArenaEvent::Notice(Notice::with_text(
                NoticeKey::ChartMissingLocally,
                chart.as_str(),
            )));
            return Ok(());
        }
        self.inner.send(
            &mut core,
            MessageBody::ClientRequestChart(ChartProposal { chart }),
            now,
        );
        Ok(())
    }

    /// Sends our packed ruleset init, then signals that loading finished and we intend to
    /// start `start_offset_ms` after the host releases the barrier.
    pub fn finish_loading(&self, start_offset_ms: i64) -> Result<(), ArenaError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::Loading)?;
        let init = self.inner.state.write().local_ruleset_mut().map(|r| r.pack_init());
        if let Some(data) = init {
            self.inner
                .send(&mut core, MessageBody::ClientPlayInit(PlayBlob { data }), now);
        }
        self.inner.send(
            &mut core,
            MessageBody::ClientFinishedLoading(FinishedLoading { start_offset_ms }),
            now,
        );
        Ok(())
    }

    /// Signals that we finished playing.
    pub fn finish_playing(&self) -> Result<(), ArenaError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::Playing)?;
        self.inner
            .send(&mut core, MessageBody::ClientFinishedPlaying, now);
        Ok(())
    }

    /// Signals that we left the result screen.
    pub fn finish_result(&self) -> Result<(), ArenaError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.write();
        self.inner.require_phase(&core, Phase::ResultWait)?;
        self.inner
            .send(&mut core, MessageBody::ClientFinishedResult, now);
        Ok(())
    }

    /// Tells the host we are leaving and ends the session locally. Idempotent.
    pub fn leave(&self) {
        let now = self.inner.clock.now();
        {
            let mut core = self.inner.core.write();
            if core.closed {
                return;
            }
            if core.status == JoinStatus::Accepted {
                self.inner.send(&mut core, MessageBody::LeaveLobby, now);
            }
            self.inner.end(&mut core, None);
            info!(host = %self.inner.host, "left the lobby");
        }
        if let Some(mut reactor) = self.reactor.lock().take() {
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

    /// The configuration this client runs with.
    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.inner.config
    }

    /// The id the host assigned us, once joined.
    #[must_use]
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.inner.state.read().local_id
    }

    /// The host's endpoint.
    #[must_use]
    pub fn host_addr(&self) -> SocketAddr {
        self.inner.host
    }

    /// Returns `true` once the host stopped answering.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.inner.state.read().expired
    }

    /// The address the reactor thread listens on.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.reactor.lock().as_ref().and_then(Reactor::local_addr)
    }
}

impl Drop for ArenaClient {
    fn drop(&mut self) {
        self.leave();
    }
}

impl fmt::Debug for ArenaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.read();
        f.debug_struct("ArenaClient")
            .field("host", &self.inner.host)
            .field("status", &core.status)
            .field("phase", &self.inner.state.read().phase)
            .field("closed", &core.closed)
            .finish_non_exhaustive()
    }
}

impl MessageHandler for ClientInner {
    fn handle_message(&self, from: SocketAddr, msg: Message) {
        let now = self.clock.now();
        let mut core = self.core.write();
        if core.closed {
            return;
        }
        if from != self.host {
            trace!(%from, kind = %msg.kind(), "ignoring message from a stranger");
            return;
        }
        let Message { index, body } = msg;
        let body = match body {
            MessageBody::Ack(ack) => return self.on_ack(&mut core, index, ack, now),
            other => other,
        };
        if core.status != JoinStatus::Accepted {
            // Unanswered, so the host retransmits once we are in.
            trace!(kind = %body.kind(), "not joined yet");
            return;
        }
        let kind = body.kind();
        if kind == MessageKind::Heartbeat {
            core.last_heartbeat = now;
        }
        if kind == MessageKind::HostPlayData {
            if core.play_filter.accept(index) {
                self.dispatch(&mut core, body);
            } else {
                trace!(%index, "superseded play data");
            }
            return;
        }
        if !core.filter.accept(index) {
            trace!(%kind, %index, "duplicate message");
            // Existence checks are pure queries, so a late one still gets a real answer.
            let payload = match &body {
                MessageBody::CheckChartExist(proposal) => AckPayload::ChartExist {
                    exist: self.chart_store.has_chart(&proposal.chart),
                },
                _ => AckPayload::None,
            };
            if kind.wants_ack() {
                self.reply(
                    index,
                    Ack {
                        req_kind: kind,
                        error: ErrorCode::Ok,
                        payload,
                    },
                );
            }
            return;
        }
        let (error, payload) = self.dispatch(&mut core, body);
        if kind.wants_ack() {
            self.reply(
                index,
                Ack {
                    req_kind: kind,
                    error,
                    payload,
                },
            );
        }
    }
}

impl ClientInner {
    fn begin_join(&self, now: Instant) {
        {
            let mut state = self.state.write();
            state.reset();
            state.expired = false;
        }
        let mut core = self.core.write();
        core.join_started = now;
        let request = MessageBody::JoinLobby(JoinRequest {
            name: self.identity.name.clone(),
            version: self.identity.version.clone(),
        });
        self.send(&mut core, request, now);
        info!(host = %self.host, name = %self.identity.name, "joining lobby");
    }

    fn require_online(&self, core: &ClientCore) -> Result<Phase, ArenaError> {
        let state = self.state.read();
        if core.closed || core.status != JoinStatus::Accepted || !state.online {
            return Err(ArenaError::NotOnline);
        }
        Ok(state.phase)
    }

    fn require_phase(&self, core: &ClientCore, expected: Phase) -> Result<(), ArenaError> {
        let actual = self.require_online(core)?;
        if actual != expected {
            return Err(ArenaError::WrongPhase { expected, actual });
        }
        Ok(())
    }

    fn set_phase(&self, state: &mut SessionState, to: Phase) {
        let from = state.phase;
        if from == to {
            return;
        }
        state.phase = to;
        debug!(%from, %to, "client phase changed");
        self.events.push(ArenaEvent::PhaseChanged { from, to });
    }

    fn send(&self, core: &mut ClientCore, body: MessageBody, now: Instant) {
        let msg = Message::new(core.next_index(), body);
        if let Err(e) = core.sender.send(self.transport.as_ref(), &msg, now) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Codec,
                "could not encode {}: {}",
                msg.kind(),
                e
            );
        }
    }

    fn reply(&self, index: MessageIndex, ack: Ack) {
        let msg = Message::new(index, MessageBody::Ack(ack));
        match encode_message(&msg) {
            Ok(bytes) => self.transport.send_to(&bytes, self.host),
            Err(e) => report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Codec,
                "could not encode ack: {}",
                e
            ),
        }
    }

    /// Ends the session locally. `reason` names the event and notice to surface, if any.
    fn end(&self, core: &mut ClientCore, reason: Option<(ArenaEvent, Notice)>) {
        core.closed = true;
        core.sender.clear();
        {
            let mut state = self.state.write();
            self.set_phase(&mut state, Phase::Disbanded);
            state.reset();
            state.phase = Phase::Disbanded;
        }
        if let Some((event, notice)) = reason {
            self.events.push(ArenaEvent::Notice(notice));
            self.events.push(event);
        }
    }

    fn expire(&self, core: &mut ClientCore) {
        self.state.write().expired = true;
        info!(host = %self.host, "host stopped answering; session expired");
        self.end(
            core,
            Some((ArenaEvent::Expired, Notice::plain(NoticeKey::SessionExpired))),
        );
    }

    fn time_out_join(&self, core: &mut ClientCore) {
        if core.status != JoinStatus::Pending {
            return;
        }
        core.status = JoinStatus::TimedOut;
        core.closed = true;
        core.sender.clear();
        info!(host = %self.host, "join timed out");
        self.events
            .push(ArenaEvent::Notice(Notice::plain(NoticeKey::JoinTimedOut)));
    }

    fn on_ack(&self, core: &mut ClientCore, index: MessageIndex, ack: Ack, now: Instant) {
        let Some(entry) = core.sender.on_ack(index) else {
            trace!(%index, "ack for nothing in flight");
            return;
        };
        match entry.kind {
            MessageKind::JoinLobby => self.on_join_answer(core, ack, now),
            MessageKind::ClientRequestChart if ack.error == ErrorCode::ChartMissing => {
                let chart = match decode_message(entry.bytes()) {
                    Ok(Message {
                        body: MessageBody::ClientRequestChart(proposal),
                        ..
                    }) => proposal.chart,
                    _ => ChartHash::empty(),
                };
                self.events.push(ArenaEvent::Notice(Notice::with_text(
                    NoticeKey::HostLacksChart,
                    chart.as_str(),
                )));
            },
            kind if !ack.error.is_ok() => {
                debug!(%kind, code = %ack.error, "host refused a message");
            },
            _ => {},
        }
    }

    fn on_join_answer(&self, core: &mut ClientCore, ack: Ack, now: Instant) {
        if core.status != JoinStatus::Pending {
            return;
        }
        if !ack.error.is_ok() {
            core.status = JoinStatus::Rejected(ack.error);
            core.closed = true;
            core.sender.clear();
            info!(code = %ack.error, "join rejected");
            self.events.push(ArenaEvent::Notice(Notice::with_int(
                NoticeKey::JoinRejected,
                i64::from(u8::from(ack.error)),
            )));
            return;
        }
        let AckPayload::Roster(roster) = ack.payload else {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Roster,
                "join accepted without a roster"
            );
            return;
        };
        core.status = JoinStatus::Accepted;
        core.last_heartbeat = now;
        let mut state = self.state.write();
        state.online = true;
        state.expired = false;
        state.local_id = Some(roster.your_id);
        for member in roster.members {
            state.add_participant(member.id, member.name);
        }
        self.set_phase(&mut state, Phase::LobbyOpen);
        info!(id = %roster.your_id, host = %self.host, "joined lobby");
    }

    /// Applies one fresh message from the host. Returns the acknowledgment contents.
    fn dispatch(&self, core: &mut ClientCore, body: MessageBody) -> (ErrorCode, AckPayload) {
        let mut state = self.state.write();
        match body {
            MessageBody::Heartbeat => {},
            MessageBody::Notice(notice) => self.events.push(ArenaEvent::Notice(notice)),
            MessageBody::DisbandLobby => {
                drop(state);
                info!(host = %self.host, "host disbanded the lobby");
                self.end(
                    core,
                    Some((
                        ArenaEvent::Disbanded,
                        Notice::plain(NoticeKey::LobbyDisbanded),
                    )),
                );
            },
            MessageBody::PlayerJoined(player) => {
                state.add_participant(player.id, player.name.clone());
                self.events.push(ArenaEvent::PlayerJoined {
                    id: player.id,
                    name: player.name.clone(),
                });
                self.events.push(ArenaEvent::Notice(Notice::with_text(
                    NoticeKey::PlayerJoined,
                    player.name,
                )));
            },
            MessageBody::PlayerLeft(left) => {
                if let Some(summary) = state.remove_participant(left.id) {
                    self.events.push(ArenaEvent::PlayerLeft {
                        id: left.id,
                        name: summary.name.clone(),
                    });
                    self.events.push(ArenaEvent::Notice(Notice::with_text(
                        NoticeKey::PlayerLeft,
                        summary.name,
                    )));
                }
            },
            MessageBody::HostRequestChart(proposal) => {
                let chart = proposal.chart;
                if chart.is_empty() {
                    state.clear_ready();
                    self.set_phase(&mut state, Phase::LobbyOpen);
                } else {
                    self.set_phase(&mut state, Phase::ChartNegotiation);
                }
                state.chart = chart.clone();
                self.events.push(ArenaEvent::ChartSelected { chart });
            },
            MessageBody::CheckChartExist(proposal) => {
                let exist = self.chart_store.has_chart(&proposal.chart);
                if !exist {
                    self.events.push(ArenaEvent::Notice(Notice::with_text(
                        NoticeKey::ChartMissingLocally,
                        proposal.chart.as_str(),
                    )));
                }
                if state.phase == Phase::LobbyOpen {
                    self.set_phase(&mut state, Phase::ChartNegotiation);
                }
                return (ErrorCode::Ok, AckPayload::ChartExist { exist });
            },
            MessageBody::HostReadyStat(stat) => {
                for (id, ready) in &stat.ready {
                    state.set_ready(*id, *ready);
                }
                self.events
                    .push(ArenaEvent::ReadyChanged { ready: stat.ready });
            },
            MessageBody::HostStartPlaying(start) => {
                state.seed = start.seed;
                state.chart = start.chart.clone();
                state.playing = true;
                state.playing_finished = false;
                state.start_delay_ms = None;
                for id in state.participants.clone() {
                    let ruleset = self.rulesets.create(id, start.seed, &start.chart);
                    if let Some(summary) = state.summaries.get_mut(&id) {
                        summary.ruleset = Some(ruleset);
                    }
                }
                self.set_phase(&mut state, Phase::Loading);
                info!(seed = start.seed, chart = %start.chart, "round started");
                self.events.push(ArenaEvent::StartPlaying {
                    seed: start.seed,
                    chart: start.chart,
                });
            },
            MessageBody::HostPlayInit(relay) => {
                let local = state.local_id;
                for (id, blob) in &relay.entries {
                    if Some(*id) != local {
                        if let Some(mirror) = state.ruleset_mut(*id) {
                            mirror.unpack_init(blob);
                        }
                    }
                }
            },
            MessageBody::HostFinishedLoading(start) => {
                state.start_delay_ms = Some(start.start_ms);
                self.set_phase(&mut state, Phase::Playing);
                info!(start_ms = start.start_ms, "start time received");
                self.events.push(ArenaEvent::StartTimeDecided {
                    start_ms: start.start_ms,
                });
            },
            MessageBody::HostPlayData(relay) => {
                if state.phase == Phase::Playing {
                    let local = state.local_id;
                    for (id, frame) in &relay.entries {
                        if Some(*id) != local {
                            if let Some(mirror) = state.ruleset_mut(*id) {
                                mirror.unpack_frame(frame);
                            }
                        }
                    }
                }
            },
            MessageBody::HostFinishedPlaying => {
                state.playing_finished = true;
                self.set_phase(&mut state, Phase::ResultWait);
            },
            MessageBody::HostFinishedResult => {
                state.clear_round();
                self.set_phase(&mut state, Phase::LobbyOpen);
                self.events.push(ArenaEvent::ReadyChanged {
                    ready: state.ready_map(),
                });
            },
            other => {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Roster,
                    "host sent {}, which only a client sends",
                    other.kind()
                );
                return (ErrorCode::WrongPhase, AckPayload::None);
            },
        }
        (ErrorCode::Ok, AckPayload::None)
    }

    fn update(&self) {
        let now = self.clock.now();
        let mut core = self.core.write();
        if core.closed {
            return;
        }
        let expired = core.sender.tick(self.transport.as_ref(), now);
        match core.status {
            JoinStatus::Pending => {
                if !expired.is_empty()
                    || now.saturating_duration_since(core.join_started) >= self.config.join_timeout
                {
                    self.time_out_join(&mut core);
                }
            },
            JoinStatus::Accepted => {
                if let Some(first) = expired.first() {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Reliability,
                        "host never acknowledged {} {}",
                        first.kind,
                        first.index
                    );
                    self.expire(&mut core);
                    return;
                }
                if now.saturating_duration_since(core.last_heartbeat) > self.config.liveness_timeout
                {
                    self.expire(&mut core);
                    return;
                }
                let frame = {
                    let mut state = self.state.write();
                    if state.phase == Phase::Playing {
                        state.local_ruleset_mut().map(|r| r.pack_frame())
                    } else {
                        None
                    }
                };
                if let Some(data) = frame {
                    self.send(&mut core, MessageBody::ClientPlayData(PlayBlob { data }), now);
                }
            },
            JoinStatus::Rejected(_) | JoinStatus::TimedOut => {},
        }
    }
}
