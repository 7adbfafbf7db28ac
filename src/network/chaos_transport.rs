//! A transport wrapper for fault injection testing.
//!
//! [`ChaosTransport`] wraps any [`Transport`] and drops, duplicates or blackholes outgoing
//! datagrams according to a seeded [`ChaosConfig`], so resilience tests are reproducible.
//!
//! ```
//! use arena_sync::{ChaosConfig, ChaosTransport, Transport};
//! use std::net::SocketAddr;
//!
//! struct Null;
//! impl Transport for Null {
//!     fn send_to(&self, _: &[u8], _: SocketAddr) {}
//! }
//!
//! let config = ChaosConfig::builder()
//!     .packet_loss_rate(0.2)
//!     .seed(42)
//!     .build();
//! let chaos = ChaosTransport::new(Null, config);
//! chaos.send_to(&[5, 0, 0, 0, 0], "127.0.0.1:52525".parse().unwrap());
//! assert_eq!(chaos.stats().packets_sent, 1);
//! ```

use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::trace;

use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::Transport;

/// Fault injection settings. All rates default to 0.0 (no effect).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChaosConfig {
    /// Probability of dropping a datagram (0.0 - 1.0).
    pub loss_rate: f64,
    /// Probability of sending a datagram twice (0.0 - 1.0).
    pub duplication_rate: f64,
    /// Probability of starting a burst loss event (0.0 - 1.0).
    pub burst_loss_probability: f64,
    /// Consecutive datagrams dropped by one burst.
    pub burst_loss_length: usize,
    /// Seed for reproducible runs. `None` draws one from entropy.
    pub seed: Option<u64>,
}

impl ChaosConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::default()
    }

    /// No faults.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Uniform random loss.
    #[must_use]
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
            ..Self::default()
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Sets the drop rate.
    #[must_use]
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the duplication rate.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets burst loss parameters.
    ///
    /// When a burst is triggered (with `probability`), `length` consecutive
    /// datagrams are dropped.
    #[must_use]
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters of what the wrapper did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Datagrams handed to the wrapper.
    pub packets_sent: u64,
    /// Datagrams dropped by random loss or blackholing.
    pub packets_dropped: u64,
    /// Datagrams sent twice.
    pub packets_duplicated: u64,
    /// Burst loss events triggered.
    pub burst_loss_events: u64,
    /// Datagrams dropped by bursts.
    pub packets_dropped_burst: u64,
}

#[derive(Debug)]
struct ChaosState {
    config: ChaosConfig,
    rng: Pcg32,
    burst_loss_remaining: usize,
    blackhole: bool,
    stats: ChaosStats,
}

impl ChaosState {
    fn should_drop_burst(&mut self) -> bool {
        if self.burst_loss_remaining > 0 {
            self.burst_loss_remaining -= 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0
            && self.rng.gen_bool(self.config.burst_loss_probability)
        {
            self.stats.burst_loss_events += 1;
            self.burst_loss_remaining = self.config.burst_loss_length.saturating_sub(1);
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        false
    }

    /// Number of copies to send: 0, 1 or 2.
    fn copies(&mut self) -> usize {
        self.stats.packets_sent += 1;
        if self.blackhole || self.rng.gen_bool(self.config.loss_rate) {
            self.stats.packets_dropped += 1;
            return 0;
        }
        if self.should_drop_burst() {
            return 0;
        }
        if self.rng.gen_bool(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            return 2;
        }
        1
    }
}

/// A [`Transport`] that injects faults into outgoing datagrams.
#[derive(Debug)]
pub struct ChaosTransport<T> {
    inner: T,
    state: Mutex<ChaosState>,
}

impl<T: Transport> ChaosTransport<T> {
    /// Wraps `inner`.
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        Self {
            inner,
            state: Mutex::new(ChaosState {
                config,
                rng,
                burst_loss_remaining: 0,
                blackhole: false,
                stats: ChaosStats::default(),
            }),
        }
    }

    /// The wrapped transport.
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    /// Replaces the fault settings, keeping the random stream.
    pub fn set_config(&self, config: ChaosConfig) {
        self.state.lock().config = config;
    }

    /// Drops every datagram while `on`, simulating a cut cable.
    pub fn set_blackhole(&self, on: bool) {
        self.state.lock().blackhole = on;
    }

    /// What happened so far.
    pub fn stats(&self) -> ChaosStats {
        self.state.lock().stats
    }
}

impl<T: Transport> Transport for ChaosTransport<T> {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) {
        let copies = self.state.lock().copies();
        if copies == 0 {
            trace!(to = %addr, len = bytes.len(), "chaos dropped datagram");
        }
        for _ in 0..copies {
            self.inner.send_to(bytes, addr);
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
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counting(AtomicU64);

    impl Transport for Counting {
        fn send_to(&self, _: &[u8], _: SocketAddr) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:52525".parse().unwrap()
    }

    fn delivered(chaos: &ChaosTransport<Counting>) -> u64 {
        chaos.inner().0.load(Ordering::Relaxed)
    }

    #[test]
    fn passthrough_delivers_everything() {
        let chaos = ChaosTransport::new(Counting::default(), ChaosConfig::passthrough());
        for _ in 0..50 {
            chaos.send_to(&[1], addr());
        }
        assert_eq!(delivered(&chaos), 50);
        assert_eq!(chaos.stats().packets_dropped, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let chaos = ChaosTransport::new(Counting::default(), ChaosConfig::lossy(1.0));
        for _ in 0..50 {
            chaos.send_to(&[1], addr());
        }
        assert_eq!(delivered(&chaos), 0);
        assert_eq!(chaos.stats().packets_dropped, 50);
    }

    #[test]
    fn partial_loss_is_roughly_the_rate() {
        let config = ChaosConfig::builder()
            .packet_loss_rate(0.5)
            .seed(3)
            .build();
        let chaos = ChaosTransport::new(Counting::default(), config);
        for _ in 0..1_000 {
            chaos.send_to(&[1], addr());
        }
        let got = delivered(&chaos);
        assert!((400..600).contains(&got), "delivered {got}");
    }

    #[test]
    fn duplication_sends_twice() {
        let config = ChaosConfig::builder().duplication_rate(1.0).build();
        let chaos = ChaosTransport::new(Counting::default(), config);
        chaos.send_to(&[1], addr());
        assert_eq!(delivered(&chaos), 2);
        assert_eq!(chaos.stats().packets_duplicated, 1);
    }

    #[test]
    fn burst_drops_consecutive_packets() {
        let config = ChaosConfig::builder().burst_loss(1.0, 3).seed(1).build();
        let chaos = ChaosTransport::new(Counting::default(), config);
        for _ in 0..3 {
            chaos.send_to(&[1], addr());
        }
        let stats = chaos.stats();
        assert_eq!(delivered(&chaos), 0);
        assert_eq!(stats.burst_loss_events, 1);
        assert_eq!(stats.packets_dropped_burst, 3);
    }

    #[test]
    fn blackhole_toggles() {
        let chaos = ChaosTransport::new(Counting::default(), ChaosConfig::passthrough());
        chaos.set_blackhole(true);
        chaos.send_to(&[1], addr());
        chaos.set_blackhole(false);
        chaos.send_to(&[1], addr());
        assert_eq!(delivered(&chaos), 1);
    }

    #[test]
    fn same_seed_same_drops() {
        let run = || {
            let config = ChaosConfig::builder()
                .packet_loss_rate(0.3)
                .duplication_rate(0.1)
                .seed(77)
                .build();
            let chaos = ChaosTransport::new(Counting::default(), config);
            for _ in 0..200 {
                chaos.send_to(&[1], addr());
            }
            chaos.stats()
        };
        assert_eq!(run(), run());
    }
}
