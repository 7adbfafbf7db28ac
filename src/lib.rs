//! # Arena Sync
//!
//! Lobby, chart negotiation and lockstep round synchronization for rhythm-game arena
//! sessions over UDP.
//!
//! One instance hosts ([`ArenaHost`]), the others join ([`ArenaClient`]). The host owns the
//! authoritative roster and relays everything in a star topology. A round moves through
//! lobby, chart negotiation, loading, playing and results; the three barrier phases only
//! advance once every participant has signaled.
//!
//! Background reactor threads only decode datagrams and hand them to the session manager.
//! Everything time-based (retransmission, heartbeats, liveness sweeps, phase advancement
//! and play-data fan-out) happens in `update()`, which the game calls once per frame.
//!
//! ```no_run
//! use arena_sync::{ArenaBuilder, LocalIdentity};
//! # use arena_sync::{ChartHash, ChartStore, ParticipantId, Ruleset, RulesetFactory};
//! # use std::sync::Arc;
//! # struct Library;
//! # impl ChartStore for Library { fn has_chart(&self, _: &ChartHash) -> bool { true } }
//! # struct Judge;
//! # impl Ruleset for Judge {
//! #     fn pack_init(&self) -> Vec<u8> { Vec::new() }
//! #     fn unpack_init(&mut self, _: &[u8]) {}
//! #     fn pack_frame(&self) -> Vec<u8> { Vec::new() }
//! #     fn unpack_frame(&mut self, _: &[u8]) {}
//! # }
//! # struct Judges;
//! # impl RulesetFactory for Judges {
//! #     fn create(&self, _: ParticipantId, _: u64, _: &ChartHash) -> Box<dyn Ruleset> { Box::new(Judge) }
//! # }
//! let host = ArenaBuilder::new()
//!     .with_identity(LocalIdentity::new("rin", "1.4.2"))
//!     .with_chart_store(Arc::new(Library))
//!     .with_ruleset_factory(Arc::new(Judges))
//!     .host_on_port(52525)?;
//!
//! loop {
//!     host.update();
//!     for event in host.events() {
//!         println!("{event:?}");
//!     }
//! #   break;
//! }
//! # Ok::<(), arena_sync::ArenaError>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ArenaError;
pub use network::chaos_transport::{ChaosConfig, ChaosStats, ChaosTransport};
pub use network::discovery::{seek_lobbies, seek_lobbies_at, LobbyInfo};
pub use network::messages::{ErrorCode, Message, Notice, NoticeArg, NoticeKey};
pub use network::reactor::{MessageHandler, Reactor};
pub use network::transport::DualStackTransport;
pub use network::udp_transport::UdpTransport;
pub use sessions::builder::ArenaBuilder;
pub use sessions::client::{ArenaClient, JoinStatus};
pub use sessions::config::{ArenaConfig, LocalIdentity, DEFAULT_PORT};
pub use sessions::event_drain::EventDrain;
pub use sessions::host::ArenaHost;
pub use sessions::state::{shared_state, Phase, SessionState, SharedState};

pub mod clock;
pub mod error;
/// Internal random number generator based on PCG32.
pub mod rng;
pub mod telemetry;
/// Host and client session managers and the state they share with the game.
pub mod sessions {
    pub mod builder;
    pub mod client;
    pub mod config;
    pub mod event_drain;
    pub mod host;
    pub mod negotiation;
    pub mod roster;
    pub mod state;
}
/// Wire format, reliability and transports.
pub mod network {
    pub mod chaos_transport;
    pub mod codec;
    pub mod discovery;
    pub mod messages;
    pub mod reactor;
    pub mod reliability;
    pub mod transport;
    pub mod udp_transport;
}

/// Maximum number of undrained events a session keeps. Older events are discarded first.
pub const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Identifies a participant within one session. The host is always [`ParticipantId::HOST`].
///
/// ```
/// use arena_sync::ParticipantId;
///
/// assert!(ParticipantId::HOST.is_host());
/// assert_eq!(ParticipantId::new(3).as_u32(), 3);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ParticipantId(u32);

impl ParticipantId {
    /// The host's id.
    pub const HOST: Self = Self(0);

    /// Creates an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` for the host.
    #[inline]
    #[must_use]
    pub const fn is_host(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash identifying a chart. The empty hash means "no chart".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChartHash(String);

impl ChartHash {
    /// Wraps a hash string.
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// The "no chart" hash.
    #[must_use]
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Returns `true` for the "no chart" hash.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The hash string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChartHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something a session manager wants the game or UI to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaEvent {
    /// A localized text event for the notification layer.
    Notice(Notice),
    /// The session moved to another phase.
    PhaseChanged {
        /// The previous phase.
        from: Phase,
        /// The new phase.
        to: Phase,
    },
    /// A participant joined.
    PlayerJoined {
        /// The new participant.
        id: ParticipantId,
        /// Their display name.
        name: String,
    },
    /// A participant left or was removed.
    PlayerLeft {
        /// The removed participant.
        id: ParticipantId,
        /// Their display name.
        name: String,
    },
    /// Someone's readiness changed.
    ReadyChanged {
        /// Readiness of every participant.
        ready: Vec<(ParticipantId, bool)>,
    },
    /// A chart was put under negotiation (client) or agreed (host). Empty means reset.
    ChartSelected {
        /// The chart.
        chart: ChartHash,
    },
    /// A round started.
    StartPlaying {
        /// Shared note-layout seed.
        seed: u64,
        /// The agreed chart.
        chart: ChartHash,
    },
    /// The loading barrier was released.
    StartTimeDecided {
        /// Start play this many milliseconds from now.
        start_ms: i64,
    },
    /// The lobby was closed by the host.
    Disbanded,
    /// The other side stopped answering; the session is over.
    Expired,
}

/// Sends datagrams. Best effort: failures are reported through telemetry, never returned.
///
/// Implementations must not block for long; sends happen on the game thread.
pub trait Transport: Send + Sync {
    /// Sends one datagram to `addr`.
    fn send_to(&self, bytes: &[u8], addr: SocketAddr);
}

/// The local chart library.
pub trait ChartStore: Send + Sync {
    /// Returns `true` if the chart with this hash is installed.
    fn has_chart(&self, hash: &ChartHash) -> bool;
}

/// A gameplay judge whose state the arena relays but never interprets.
pub trait Ruleset: Send + Sync {
    /// Serializes the state needed to build a mirror of this judge.
    fn pack_init(&self) -> Vec<u8>;
    /// Initializes this (mirror) judge from [`pack_init`](Self::pack_init) bytes.
    fn unpack_init(&mut self, bytes: &[u8]);
    /// Serializes the current frame's state.
    fn pack_frame(&self) -> Vec<u8>;
    /// Applies a frame produced by [`pack_frame`](Self::pack_frame).
    fn unpack_frame(&mut self, bytes: &[u8]);
}

/// Builds a judge for each participant when a round starts.
pub trait RulesetFactory: Send + Sync {
    /// Creates the judge for `participant` playing `chart` with `seed`.
    fn create(&self, participant: ParticipantId, seed: u64, chart: &ChartHash)
        -> Box<dyn Ruleset>;
}
