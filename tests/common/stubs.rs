//! Stand-ins for the game's chart library and judges.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::BTreeSet;

use arena_sync::{ChartHash, ChartStore, ParticipantId, Ruleset, RulesetFactory};

/// A fixed set of installed charts.
#[derive(Debug, Default, Clone)]
pub struct StubChartStore {
    charts: BTreeSet<ChartHash>,
}

impl StubChartStore {
    pub fn with(charts: &[&str]) -> Self {
        Self {
            charts: charts.iter().map(|c| ChartHash::new(*c)).collect(),
        }
    }
}

impl ChartStore for StubChartStore {
    fn has_chart(&self, hash: &ChartHash) -> bool {
        self.charts.contains(hash)
    }
}

/// A judge whose blobs say who built it and for whom.
///
/// `pack_init` returns `[side, owner]`. A mirror that received a relayed init therefore
/// reports the remote side's tag instead of its own.
#[derive(Debug, Clone)]
pub struct StubRuleset {
    pub init: Vec<u8>,
    pub frame: Vec<u8>,
    pub frames_applied: u32,
}

impl Ruleset for StubRuleset {
    fn pack_init(&self) -> Vec<u8> {
        self.init.clone()
    }

    fn unpack_init(&mut self, bytes: &[u8]) {
        self.init = bytes.to_vec();
    }

    fn pack_frame(&self) -> Vec<u8> {
        self.frame.clone()
    }

    fn unpack_frame(&mut self, bytes: &[u8]) {
        self.frame = bytes.to_vec();
        self.frames_applied += 1;
    }
}

/// Builds [`StubRuleset`]s tagged with `side`.
#[derive(Debug, Clone, Copy)]
pub struct StubFactory {
    pub side: u8,
}

impl RulesetFactory for StubFactory {
    fn create(&self, participant: ParticipantId, seed: u64, _: &ChartHash) -> Box<dyn Ruleset> {
        let owner = participant.as_u32() as u8;
        Box::new(StubRuleset {
            init: vec![self.side, owner],
            frame: vec![self.side, owner, seed as u8],
            frames_applied: 0,
        })
    }
}
