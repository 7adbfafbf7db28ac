//! Shared test utilities for integration tests.
//!
//! Sessions are driven deterministically: every participant shares one [`ManualClock`], and
//! datagrams travel through a [`SimNetwork`] that delivers them once the clock passes their
//! arrival time. Nothing sleeps and nothing binds a socket.
//!
//! ```ignore
//! let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
//! let rin = lobby.join("rin", &["h1"]);
//! lobby.pump();
//! assert_eq!(lobby.client(rin).join_status(), JoinStatus::Accepted);
//! ```

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use arena_sync::{
    ArenaBuilder, ArenaClient, ArenaConfig, ArenaEvent, ArenaHost, ChaosConfig, ChaosTransport,
    Clock, LocalIdentity, ManualClock, Transport,
};
use arena_sync::network::codec::peek_header;
use arena_sync::network::messages::MessageKind;
use arena_sync::telemetry::CollectingObserver;
use parking_lot::Mutex;
use web_time::Instant;

use super::stubs::{StubChartStore, StubFactory};

/// Build version every simulated participant runs unless a test says otherwise.
pub const VERSION: &str = "1.0.0";

/// The host's endpoint on the simulated network.
pub const HOST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 52525));

/// Ruleset tag of the host's judges.
pub const HOST_SIDE: u8 = 0xA0;

/// The endpoint of the `n`th simulated client.
#[must_use]
pub fn client_addr(n: usize) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::new(10, 0, 1, n as u8 + 1),
        40000 + n as u16,
    ))
}

/// Ruleset tag of the `n`th client's judges.
#[must_use]
pub fn client_side(n: usize) -> u8 {
    0xC0 + n as u8
}

/// One datagram in flight.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
    pub deliver_at: Instant,
}

/// A lossless network with per-endpoint one-way latency.
///
/// A datagram from `a` to `b` arrives `latency(a) + latency(b)` after it was sent.
#[derive(Debug)]
pub struct SimNetwork {
    clock: Arc<ManualClock>,
    in_flight: Mutex<Vec<Datagram>>,
    latency: Mutex<HashMap<SocketAddr, Duration>>,
    cut: Mutex<Vec<SocketAddr>>,
    drops: Mutex<Vec<(SocketAddr, MessageKind)>>,
}

impl SimNetwork {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            in_flight: Mutex::new(Vec::new()),
            latency: Mutex::new(HashMap::new()),
            cut: Mutex::new(Vec::new()),
            drops: Mutex::new(Vec::new()),
        })
    }

    /// Sets the one-way latency of `addr`'s link.
    pub fn set_latency(&self, addr: SocketAddr, one_way: Duration) {
        self.latency.lock().insert(addr, one_way);
    }

    /// Silently drops everything sent to or from `addr` from now on.
    pub fn cut(&self, addr: SocketAddr) {
        self.cut.lock().push(addr);
    }

    /// Silently drops the next datagram of `kind` sent to `to`. Retransmissions get through.
    pub fn drop_next(&self, to: SocketAddr, kind: MessageKind) {
        self.drops.lock().push((to, kind));
    }

    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> SimTransport {
        SimTransport {
            local: addr,
            net: Arc::clone(self),
        }
    }

    fn enqueue(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        {
            let cut = self.cut.lock();
            if cut.contains(&from) || cut.contains(&to) {
                return;
            }
        }
        if let Ok((kind, _)) = peek_header(bytes) {
            let mut drops = self.drops.lock();
            if let Some(pos) = drops.iter().position(|d| *d == (to, kind)) {
                drops.remove(pos);
                return;
            }
        }
        let delay = {
            let latency = self.latency.lock();
            latency.get(&from).copied().unwrap_or_default()
                + latency.get(&to).copied().unwrap_or_default()
        };
        self.in_flight.lock().push(Datagram {
            from,
            to,
            bytes: bytes.to_vec(),
            deliver_at: self.clock.now() + delay,
        });
    }

    /// Removes and returns every datagram due by now, in send order.
    pub fn take_due(&self) -> Vec<Datagram> {
        let now = self.clock.now();
        let mut in_flight = self.in_flight.lock();
        let (due, later): (Vec<_>, Vec<_>) = in_flight
            .drain(..)
            .partition(|d| d.deliver_at <= now);
        *in_flight = later;
        due
    }

    /// Number of datagrams not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// One endpoint of a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    local: SocketAddr,
    net: Arc<SimNetwork>,
}

impl Transport for SimTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
        self.net.enqueue(self.local, addr, bytes);
    }
}

/// A host plus any number of clients on one simulated network.
pub struct Lobby {
    pub clock: Arc<ManualClock>,
    pub net: Arc<SimNetwork>,
    pub config: ArenaConfig,
    pub host: ArenaHost,
    pub clients: Vec<(SocketAddr, ArenaClient)>,
    /// Every violation reported by the host or any client.
    pub violations: Arc<CollectingObserver>,
    chaos: Option<ChaosConfig>,
}

impl Lobby {
    /// Starts a host owning `charts`.
    pub fn new(config: ArenaConfig, charts: &[&str]) -> Self {
        Self::build(config, charts, None)
    }

    /// Like [`Lobby::new`], but every endpoint sends through a [`ChaosTransport`] seeded from
    /// `chaos.seed` plus the endpoint's position.
    pub fn lossy(config: ArenaConfig, charts: &[&str], chaos: ChaosConfig) -> Self {
        Self::build(config, charts, Some(chaos))
    }

    fn build(config: ArenaConfig, charts: &[&str], chaos: Option<ChaosConfig>) -> Self {
        let clock = Arc::new(ManualClock::new());
        let net = SimNetwork::new(Arc::clone(&clock));
        let transport = wrap(net.endpoint(HOST_ADDR), chaos.as_ref(), 0);
        let violations = Arc::new(CollectingObserver::new());
        let host = ArenaBuilder::new()
            .with_config(config)
            .with_violation_observer(violations.clone())
            .with_identity(LocalIdentity::new("host", VERSION))
            .with_clock(clock.clone())
            .with_chart_store(Arc::new(StubChartStore::with(charts)))
            .with_ruleset_factory(Arc::new(StubFactory { side: HOST_SIDE }))
            .host_with_transport(transport)
            .unwrap();
        Self {
            clock,
            net,
            config,
            host,
            clients: Vec::new(),
            violations,
            chaos,
        }
    }

    /// Starts joining as `name`, owning `charts`. Returns the client's position.
    pub fn join(&mut self, name: &str, charts: &[&str]) -> usize {
        self.join_with(LocalIdentity::new(name, VERSION), charts)
    }

    /// Starts joining with an explicit identity.
    pub fn join_with(&mut self, identity: LocalIdentity, charts: &[&str]) -> usize {
        let n = self.clients.len();
        let addr = client_addr(n);
        self.join_from(addr, identity, charts, client_side(n))
    }

    /// Starts joining from a chosen address, e.g. one already in the lobby.
    pub fn join_from(
        &mut self,
        addr: SocketAddr,
        identity: LocalIdentity,
        charts: &[&str],
        side: u8,
    ) -> usize {
        let n = self.clients.len();
        let transport = wrap(self.net.endpoint(addr), self.chaos.as_ref(), n as u64 + 1);
        let client = ArenaBuilder::new()
            .with_config(self.config)
            .with_violation_observer(self.violations.clone())
            .with_identity(identity)
            .with_clock(self.clock.clone())
            .with_chart_store(Arc::new(StubChartStore::with(charts)))
            .with_ruleset_factory(Arc::new(StubFactory { side }))
            .join_with_transport(transport, HOST_ADDR)
            .unwrap();
        self.clients.push((addr, client));
        n
    }

    pub fn client(&self, n: usize) -> &ArenaClient {
        &self.clients[n].1
    }

    /// Delivers due datagrams until the network is quiet at the current instant.
    pub fn pump(&self) {
        for _ in 0..10_000 {
            let due = self.net.take_due();
            if due.is_empty() {
                return;
            }
            for datagram in due {
                self.deliver(&datagram);
            }
        }
        panic!("network never went quiet");
    }

    fn deliver(&self, datagram: &Datagram) {
        if datagram.to == HOST_ADDR {
            self.host.handle_datagram(datagram.from, &datagram.bytes);
            return;
        }
        // The most recent client at an address owns it.
        if let Some((_, client)) = self
            .clients
            .iter()
            .rev()
            .find(|(addr, _)| *addr == datagram.to)
        {
            client.handle_datagram(datagram.from, &datagram.bytes);
        }
    }

    /// Advances the clock by `dt`, then delivers and runs one frame everywhere.
    pub fn step(&self, dt: Duration) {
        self.clock.advance(dt);
        self.pump();
        self.host.update();
        for (_, client) in &self.clients {
            client.update();
        }
        self.pump();
    }

    /// Steps in increments of `dt` until `total` elapsed.
    pub fn run_for(&self, total: Duration, dt: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.step(dt);
            elapsed += dt;
        }
    }

    /// Steps in increments of `dt` until `done` holds, for at most `limit`. Returns whether
    /// it held.
    pub fn run_until(&self, limit: Duration, dt: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < limit {
            if done(self) {
                return true;
            }
            self.step(dt);
            elapsed += dt;
        }
        done(self)
    }

    /// Drains and returns the host's events.
    pub fn host_events(&self) -> Vec<ArenaEvent> {
        self.host.events().collect()
    }

    /// Drains and returns the `n`th client's events.
    pub fn client_events(&self, n: usize) -> Vec<ArenaEvent> {
        self.client(n).events().collect()
    }
}

fn wrap(transport: SimTransport, chaos: Option<&ChaosConfig>, offset: u64) -> Arc<dyn Transport> {
    match chaos {
        Some(config) => {
            let mut config = config.clone();
            config.seed = config.seed.map(|seed| seed.wrapping_add(offset));
            Arc::new(ChaosTransport::new(transport, config))
        },
        None => Arc::new(transport),
    }
}
