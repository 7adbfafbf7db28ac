//! Chart negotiation bookkeeping.
//!
//! Pure state: the host session decides who to message based on the outcomes returned here.
//! A proposal completes once the set of participants known to have the chart (proposer
//! and host included) reaches `clients + 1`.

use std::collections::BTreeSet;

use crate::{ChartHash, ParticipantId};

/// What the host should do after a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// The host does not have the chart; tell the proposer.
    HostLacksChart,
    /// Enough confirmations already; the proposal completed.
    Completed,
    /// Ask every client other than the proposer to confirm possession.
    AwaitConfirmations,
}

/// What the host should do after a `CheckChartExist` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The answer refers to a chart that is no longer pending.
    Stale,
    /// The responder lacks the chart; tell the proposer.
    Missing {
        /// Who proposed the pending chart.
        proposer: ParticipantId,
    },
    /// This answer completed the proposal.
    Completed {
        /// Who proposed the pending chart.
        proposer: ParticipantId,
    },
    /// Still waiting for other answers.
    Waiting,
}

/// The pending proposal and its confirmations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pending: ChartHash,
    proposer: Option<ParticipantId>,
    confirmed: BTreeSet<ParticipantId>,
}

impl Negotiation {
    /// No proposal pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The chart under negotiation. Empty when none.
    #[must_use]
    pub const fn pending(&self) -> &ChartHash {
        &self.pending
    }

    /// Who proposed the pending chart.
    #[must_use]
    pub const fn proposer(&self) -> Option<ParticipantId> {
        self.proposer
    }

    /// Number of participants known to have the pending chart.
    #[must_use]
    pub fn confirmations(&self) -> usize {
        self.confirmed.len()
    }

    /// Records a proposal of `chart` by `proposer`.
    ///
    /// A chart different from the pending one clears every prior confirmation.
    pub fn propose(
        &mut self,
        proposer: ParticipantId,
        chart: &ChartHash,
        host_has_chart: bool,
        clients: usize,
    ) -> ProposalOutcome {
        if *chart != self.pending {
            self.pending = chart.clone();
            self.confirmed.clear();
        }
        if !host_has_chart {
            self.pending = ChartHash::empty();
            self.proposer = None;
            self.confirmed.clear();
            return ProposalOutcome::HostLacksChart;
        }
        self.proposer = Some(proposer);
        self.confirmed.insert(proposer);
        self.confirmed.insert(ParticipantId::HOST);
        if self.is_complete(clients) {
            ProposalOutcome::Completed
        } else {
            ProposalOutcome::AwaitConfirmations
        }
    }

    /// Records a `CheckChartExist` answer from `responder`.
    pub fn confirm(
        &mut self,
        responder: ParticipantId,
        chart: &ChartHash,
        exist: bool,
        clients: usize,
    ) -> ConfirmOutcome {
        let Some(proposer) = self.proposer else {
            return ConfirmOutcome::Stale;
        };
        if chart.is_empty() || *chart != self.pending {
            return ConfirmOutcome::Stale;
        }
        if !exist {
            return ConfirmOutcome::Missing { proposer };
        }
        let newly = self.confirmed.insert(responder);
        if newly && self.is_complete(clients) {
            ConfirmOutcome::Completed { proposer }
        } else {
            ConfirmOutcome::Waiting
        }
    }

    /// Returns `true` if `id` is known to have the pending chart.
    #[must_use]
    pub fn has_confirmed(&self, id: ParticipantId) -> bool {
        self.confirmed.contains(&id)
    }

    /// Re-checks completion after the roster shrank.
    #[must_use]
    pub fn completes_with(&self, clients: usize) -> Option<ParticipantId> {
        if self.is_complete(clients) {
            self.proposer
        } else {
            None
        }
    }

    /// Forgets a participant's confirmation, e.g. after it left.
    pub fn forget(&mut self, id: ParticipantId) {
        self.confirmed.remove(&id);
    }

    /// Drops the pending proposal.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn is_complete(&self, clients: usize) -> bool {
        self.proposer.is_some() && self.confirmed.len() >= clients + 1
    }
}
