//! When is a negotiation done?

use negotopo_agents::Participant;
use negotopo_protocol::RoundRecord;

pub trait AgreementPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn agreement_reached(&self, participants: &[Participant], history: &[RoundRecord]) -> bool;
}

/// Strict: every agent has an empty needs list.
#[derive(Clone, Debug, Default)]
pub struct AllSatisfied;

impl AgreementPolicy for AllSatisfied {
    fn name(&self) -> &'static str {
        "all_satisfied"
    }

    fn agreement_reached(&self, participants: &[Participant], _history: &[RoundRecord]) -> bool {
        participants.iter().all(|p| p.agent.needs_satisfied())
    }
}

/// Loose convergence proxy: enough acceptances over the most recent rounds.
#[derive(Clone, Debug)]
pub struct RecentAcceptances {
    pub window: usize,
    pub min_acceptances: usize,
}

impl Default for RecentAcceptances {
    fn default() -> Self {
        Self {
            window: 3,
            min_acceptances: 3,
        }
    }
}

impl AgreementPolicy for RecentAcceptances {
    fn name(&self) -> &'static str {
        "recent_acceptances"
    }

    fn agreement_reached(&self, _participants: &[Participant], history: &[RoundRecord]) -> bool {
        let recent: usize = history
            .iter()
            .rev()
            .take(self.window)
            .map(|r| r.stats.acceptances)
            .sum();
        recent >= self.min_acceptances
    }
}

/// Default runner policy: strict satisfaction, or the recent-acceptance
/// heuristic as an early stop.
#[derive(Clone, Debug, Default)]
pub struct SatisfiedOrConverging {
    pub strict: AllSatisfied,
    pub heuristic: RecentAcceptances,
}

impl AgreementPolicy for SatisfiedOrConverging {
    fn name(&self) -> &'static str {
        "satisfied_or_converging"
    }

    fn agreement_reached(&self, participants: &[Participant], history: &[RoundRecord]) -> bool {
        self.strict.agreement_reached(participants, history)
            || self.heuristic.agreement_reached(participants, history)
    }
}
