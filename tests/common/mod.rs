//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: chart library and ruleset stand-ins
//! - `test_utils`: a simulated network driven by a manual clock, and a lobby harness
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::test_utils::Lobby;
//!
//! let mut lobby = Lobby::new(ArenaConfig::default(), &["h1"]);
//! let rin = lobby.join("rin", &["h1"]);
//! lobby.pump();
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use test_utils::{client_addr, Lobby, SimNetwork, SimTransport, HOST_ADDR, VERSION};
