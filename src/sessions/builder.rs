//! Fluent construction of host and client sessions.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::network::reactor::Reactor;
use crate::network::transport::DualStackTransport;
use crate::network::udp_transport::UdpTransport;
use crate::sessions::client::ArenaClient;
use crate::sessions::config::{ArenaConfig, LocalIdentity};
use crate::sessions::host::ArenaHost;
use crate::sessions::state::{shared_state, SharedState};
use crate::telemetry::ViolationObserver;
use crate::{ArenaError, ChartStore, RulesetFactory, Transport};

/// Everything a session manager is built from.
pub(crate) struct SessionParts {
    pub(crate) config: ArenaConfig,
    pub(crate) identity: LocalIdentity,
    pub(crate) state: SharedState,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) chart_store: Arc<dyn ChartStore>,
    pub(crate) rulesets: Arc<dyn RulesetFactory>,
    pub(crate) observer: Option<Arc<dyn ViolationObserver>>,
}

/// Builds an [`ArenaHost`] or an [`ArenaClient`].
///
/// The chart store and ruleset factory are required; everything else has a default.
///
/// ```no_run
/// use arena_sync::{ArenaBuilder, ArenaConfig, LocalIdentity};
/// # use arena_sync::{ChartHash, ChartStore, ParticipantId, Ruleset, RulesetFactory};
/// # use std::sync::Arc;
/// # struct Library;
/// # impl ChartStore for Library { fn has_chart(&self, _: &ChartHash) -> bool { true } }
/// # struct Judges;
/// # impl RulesetFactory for Judges {
/// #     fn create(&self, _: ParticipantId, _: u64, _: &ChartHash) -> Box<dyn Ruleset> { unimplemented!() }
/// # }
/// let client = ArenaBuilder::new()
///     .with_config(ArenaConfig::lan())
///     .with_identity(LocalIdentity::new("mika", "1.4.2"))
///     .with_chart_store(Arc::new(Library))
///     .with_ruleset_factory(Arc::new(Judges))
///     .join("192.168.1.20:52525".parse().unwrap())?;
/// # Ok::<(), arena_sync::ArenaError>(())
/// ```
#[must_use = "ArenaBuilder does nothing until host_on_port(), host_with_transport(), join() or join_with_transport() is called"]
pub struct ArenaBuilder {
    config: ArenaConfig,
    identity: LocalIdentity,
    state: SharedState,
    clock: Arc<dyn Clock>,
    chart_store: Option<Arc<dyn ChartStore>>,
    rulesets: Option<Arc<dyn RulesetFactory>>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for ArenaBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            config,
            identity,
            state: _,
            clock: _,
            chart_store,
            rulesets,
            observer,
        } = self;

        f.debug_struct("ArenaBuilder")
            .field("config", config)
            .field("identity", identity)
            .field("has_chart_store", &chart_store.is_some())
            .field("has_ruleset_factory", &rulesets.is_some())
            .field("has_violation_observer", &observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ArenaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            config: ArenaConfig::default(),
            identity: LocalIdentity::default(),
            state: shared_state(),
            clock: Arc::new(SystemClock),
            chart_store: None,
            rulesets: None,
            observer: None,
        }
    }

    /// Sets ports, sizes and timings.
    pub fn with_config(mut self, config: ArenaConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the name and version sent in the join handshake.
    pub fn with_identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Shares an existing [`SharedState`] with the session instead of a fresh one.
    ///
    /// Starting a session on a state that is already online fails with
    /// [`ArenaError::AlreadyOnline`].
    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = state;
        self
    }

    /// Replaces the time source, e.g. with a [`ManualClock`](crate::ManualClock) in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the local chart library used to answer existence checks.
    pub fn with_chart_store(mut self, store: Arc<dyn ChartStore>) -> Self {
        self.chart_store = Some(store);
        self
    }

    /// Sets the factory that builds a ruleset per participant when a round starts.
    pub fn with_ruleset_factory(mut self, factory: Arc<dyn RulesetFactory>) -> Self {
        self.rulesets = Some(factory);
        self
    }

    /// Routes protocol anomalies to `observer` instead of the log only.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Binds the hosting port on both IP families and starts a reactor thread per socket.
    ///
    /// Port 0 picks a free port; [`ArenaHost::config`] reports the one bound. A missing IPv6
    /// stack is tolerated.
    ///
    /// # Errors
    /// - [`ArenaError::AlreadyOnline`] if the shared state already hosts or joined a lobby.
    /// - [`ArenaError::InvalidConfig`] for bad settings or a missing collaborator.
    /// - [`ArenaError::Socket`] if no socket could be bound.
    pub fn host_on_port(mut self, port: u16) -> Result<ArenaHost, ArenaError> {
        self.preflight()?;
        let v4 = UdpTransport::bind_v4(port).map(Arc::new);
        let bound = match &v4 {
            Ok(socket) => socket.local_addr()?.port(),
            Err(_) => port,
        };
        let v6 = UdpTransport::bind_v6(bound).map(Arc::new);
        let (v4, v6) = match (v4, v6) {
            (Err(e), Err(_)) => {
                return Err(ArenaError::Socket {
                    context: format!("binding port {port}: {e}"),
                })
            },
            (v4, v6) => {
                if let Err(e) = &v6 {
                    debug!(port = bound, error = %e, "no IPv6 socket; hosting on IPv4 only");
                }
                (v4.ok(), v6.ok())
            },
        };
        let bound = match (&v4, &v6) {
            (Some(socket), _) | (None, Some(socket)) => socket.local_addr()?.port(),
            (None, None) => bound,
        };
        self.config.port = bound;

        let transport = Arc::new(DualStackTransport::new(v4.clone(), v6.clone()));
        let host = ArenaHost::start(self.into_parts(transport)?);
        for (name, socket) in [("arena-host-v4", v4), ("arena-host-v6", v6)] {
            if let Some(socket) = socket {
                host.attach_reactor(Reactor::spawn(name, socket, host.handler())?);
            }
        }
        Ok(host)
    }

    /// Starts a host that sends through `transport`. Nothing is received automatically:
    /// feed inbound datagrams to [`ArenaHost::handle_datagram`].
    ///
    /// # Errors
    /// - [`ArenaError::AlreadyOnline`] if the shared state already hosts or joined a lobby.
    /// - [`ArenaError::InvalidConfig`] for bad settings or a missing collaborator.
    pub fn host_with_transport(
        self,
        transport: Arc<dyn Transport>,
    ) -> Result<ArenaHost, ArenaError> {
        self.preflight()?;
        Ok(ArenaHost::start(self.into_parts(transport)?))
    }

    /// Joins the lobby at `host`, blocking until it answers or the join timeout elapses.
    ///
    /// # Errors
    /// - [`ArenaError::JoinRejected`] with the host's reason.
    /// - [`ArenaError::JoinTimedOut`] if the host never answered.
    /// - [`ArenaError::AlreadyOnline`], [`ArenaError::InvalidConfig`] or
    ///   [`ArenaError::Socket`] before anything is sent.
    pub fn join(self, host: SocketAddr) -> Result<ArenaClient, ArenaError> {
        self.preflight()?;
        let socket = Arc::new(match host {
            SocketAddr::V4(_) => UdpTransport::bind_v4(0)?,
            SocketAddr::V6(_) => UdpTransport::bind_v6(0)?,
        });
        let transport: Arc<dyn Transport> = socket.clone();
        let client = ArenaClient::connect(self.into_parts(transport)?, host);
        client.attach_reactor(Reactor::spawn("arena-client", socket, client.handler())?);
        client.wait_for_join()?;
        Ok(client)
    }

    /// Sends a join request to `host` through `transport` and returns at once. Feed inbound
    /// datagrams to [`ArenaClient::handle_datagram`] and watch
    /// [`ArenaClient::join_status`].
    ///
    /// # Errors
    /// - [`ArenaError::AlreadyOnline`] if the shared state already hosts or joined a lobby.
    /// - [`ArenaError::InvalidConfig`] for bad settings or a missing collaborator.
    pub fn join_with_transport(
        self,
        transport: Arc<dyn Transport>,
        host: SocketAddr,
    ) -> Result<ArenaClient, ArenaError> {
        self.preflight()?;
        Ok(ArenaClient::connect(self.into_parts(transport)?, host))
    }

    /// Checks everything that must hold before a socket is touched.
    fn preflight(&self) -> Result<(), ArenaError> {
        self.config.validate()?;
        if self.state.read().online {
            return Err(ArenaError::AlreadyOnline);
        }
        Ok(())
    }

    fn into_parts(self, transport: Arc<dyn Transport>) -> Result<SessionParts, ArenaError> {
        let chart_store = self.chart_store.ok_or_else(|| ArenaError::InvalidConfig {
            field: "chart_store",
            reason: "a chart store is required".to_owned(),
        })?;
        let rulesets = self.rulesets.ok_or_else(|| ArenaError::InvalidConfig {
            field: "ruleset_factory",
            reason: "a ruleset factory is required".to_owned(),
        })?;
        Ok(SessionParts {
            config: self.config,
            identity: self.identity,
            state: self.state,
            transport,
            clock: self.clock,
            chart_store,
            rulesets,
            observer: self.observer,
        })
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
    use crate::{ChartHash, ParticipantId, Ruleset};

    struct NoCharts;
    impl ChartStore for NoCharts {
        fn has_chart(&self, _: &ChartHash) -> bool {
            false
        }
    }

    struct Inert;
    impl Ruleset for Inert {
        fn pack_init(&self) -> Vec<u8> {
            Vec::new()
        }
        fn unpack_init(&mut self, _: &[u8]) {}
        fn pack_frame(&self) -> Vec<u8> {
            Vec::new()
        }
        fn unpack_frame(&mut self, _: &[u8]) {}
    }

    struct InertFactory;
    impl RulesetFactory for InertFactory {
        fn create(&self, _: ParticipantId, _: u64, _: &ChartHash) -> Box<dyn Ruleset> {
            Box::new(Inert)
        }
    }

    struct Null;
    impl Transport for Null {
        fn send_to(&self, _: &[u8], _: SocketAddr) {}
    }

    fn complete() -> ArenaBuilder {
        ArenaBuilder::new()
            .with_config(ArenaConfig::testing())
            .with_chart_store(Arc::new(NoCharts))
            .with_ruleset_factory(Arc::new(InertFactory))
    }

    #[test]
    fn missing_chart_store_is_a_config_error() {
        let err = ArenaBuilder::new()
            .with_ruleset_factory(Arc::new(InertFactory))
            .host_with_transport(Arc::new(Null))
            .unwrap_err();
        assert!(matches!(
            err,
            ArenaError::InvalidConfig {
                field: "chart_store",
                ..
            }
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_start() {
        let config = ArenaConfig {
            max_participants: 0,
            ..ArenaConfig::testing()
        };
        let err = complete()
            .with_config(config)
            .host_with_transport(Arc::new(Null))
            .unwrap_err();
        assert!(matches!(err, ArenaError::InvalidConfig { .. }));
    }

    #[test]
    fn hosting_twice_on_one_state_fails() {
        let state = shared_state();
        let host = complete()
            .with_state(state.clone())
            .host_with_transport(Arc::new(Null))
            .unwrap();
        assert!(state.read().online);

        let err = complete()
            .with_state(state.clone())
            .join_with_transport(Arc::new(Null), "127.0.0.1:52525".parse().unwrap())
            .unwrap_err();
        assert_eq!(err, ArenaError::AlreadyOnline);

        host.disband();
        assert!(!state.read().online);
    }

    #[test]
    fn debug_hides_collaborators() {
        let text = format!("{:?}", complete());
        assert!(text.contains("has_chart_store: true"));
        assert!(text.contains("has_violation_observer: false"));
    }
}
