//! Configuration types for arena sessions.
//!
//! | Type | Purpose | Presets |
//! |------|---------|---------|
//! | [`ArenaConfig`] | Ports, roster size, retry and liveness timings | `lan()`, `testing()` |
//! | [`LocalIdentity`] | Display name and build version sent in the join handshake | |
//!
//! # Example
//!
//! ```
//! use arena_sync::{ArenaConfig, LocalIdentity};
//! use web_time::Duration;
//!
//! let config = ArenaConfig {
//!     max_participants: 3,
//!     ..ArenaConfig::lan()
//! };
//! assert!(config.validate().is_ok());
//!
//! let me = LocalIdentity::new("rin", "1.4.2");
//! assert_eq!(me.name, "rin");
//! ```

use web_time::Duration;

use crate::ArenaError;

/// The well-known port hosts listen on.
pub const DEFAULT_PORT: u16 = 52525;

/// Timing and sizing for one host or client session.
///
/// # Forward Compatibility
///
/// New fields may be added. Construct with `..ArenaConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ArenaConfig has no effect unless passed to ArenaBuilder::with_config()"]
pub struct ArenaConfig {
    /// UDP port the host binds on both IP families, and the port clients probe.
    ///
    /// Default: 52525
    pub port: u16,

    /// Maximum number of clients, not counting the host.
    ///
    /// Default: 7
    pub max_participants: usize,

    /// How long a tracked message waits for its acknowledgment before it is retransmitted.
    ///
    /// Default: 5s
    pub retry_interval: Duration,

    /// Retransmissions before the destination is declared dead.
    ///
    /// A tracked message is sent at most `1 + max_retries` times.
    ///
    /// Default: 3
    pub max_retries: u32,

    /// How often the host sends a heartbeat to each client, when none is outstanding.
    ///
    /// Default: 5s
    pub heartbeat_interval: Duration,

    /// Silence after which a client is removed (host side) or the session expires
    /// (client side).
    ///
    /// Default: 30s
    pub liveness_timeout: Duration,

    /// How long [`ArenaBuilder::join`](crate::ArenaBuilder::join) waits for the host's answer.
    ///
    /// Default: 5s
    pub join_timeout: Duration,

    /// How long [`seek_lobbies`](crate::seek_lobbies) collects replies.
    ///
    /// Default: 1s
    pub discovery_timeout: Duration,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_participants: 7,
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(1),
        }
    }
}

impl ArenaConfig {
    /// Creates a new `ArenaConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Faster retries and liveness for wired local networks.
    pub fn lan() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Short timings for tests over real sockets on one machine. Binds an ephemeral port.
    pub fn testing() -> Self {
        Self {
            port: 0,
            retry_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(200),
            liveness_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.max_participants < 1 || self.max_participants > 64 {
            return Err(ArenaError::InvalidConfig {
                field: "max_participants",
                reason: format!("must be in 1..=64, got {}", self.max_participants),
            });
        }
        if self.max_retries > 32 {
            return Err(ArenaError::InvalidConfig {
                field: "max_retries",
                reason: format!("must be at most 32, got {}", self.max_retries),
            });
        }

        let durations = [
            ("retry_interval", self.retry_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("liveness_timeout", self.liveness_timeout),
            ("join_timeout", self.join_timeout),
            ("discovery_timeout", self.discovery_timeout),
        ];
        for (field, value) in durations {
            if value < Duration::from_millis(1) || value > Duration::from_secs(600) {
                return Err(ArenaError::InvalidConfig {
                    field,
                    reason: format!("must be in 1ms..=600s, got {}ms", value.as_millis()),
                });
            }
        }

        if self.liveness_timeout <= self.heartbeat_interval {
            return Err(ArenaError::InvalidConfig {
                field: "liveness_timeout",
                reason: format!(
                    "must exceed heartbeat_interval ({}ms), got {}ms",
                    self.heartbeat_interval.as_millis(),
                    self.liveness_timeout.as_millis()
                ),
            });
        }
        Ok(())
    }
}

/// Who this instance is, as sent in the join handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalIdentity {
    /// Display name shown to other participants.
    pub name: String,
    /// Protocol/build version. The host only admits exact matches.
    pub version: String,
}

impl LocalIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new("player", env!("CARGO_PKG_VERSION"))
    }
}
