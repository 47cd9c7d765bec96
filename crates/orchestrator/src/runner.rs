//! The negotiation loop.
//!
//! Each iteration checks, in order: the stop flag, the round budget, the
//! wall-clock budget and the agreement policy. Surviving all four, it
//! optionally rebuilds the topology and executes one round. `run()` loops
//! until a terminal status; `step()` advances exactly one iteration.

use crate::policy::{AgreementPolicy, SatisfiedOrConverging};
use crate::Network;
use negotopo_core::{AgentId, NegotiationError, Result, RoundContext, TopologySnapshot};
use negotopo_protocol::{NegotiationRound, RoundConfig, RoundRecord, RoundStats};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub max_rounds: usize,
    /// Wall-clock budget for the whole run. The run times out as soon as
    /// elapsed time reaches it, so `0` ends the run before the first round.
    pub timeout_ms: u64,
    /// Rebuild the graph every `topology_rebuild_interval` rounds.
    /// When false the graph is built once before the first round.
    pub dynamic_topology: bool,
    pub topology_rebuild_interval: usize,
    pub round: RoundConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            timeout_ms: 60_000,
            dynamic_topology: true,
            topology_rebuild_interval: 1,
            round: RoundConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_dynamic_topology(mut self, dynamic: bool) -> Self {
        self.dynamic_topology = dynamic;
        self
    }

    /// Zero is treated as one.
    pub fn with_rebuild_interval(mut self, interval: usize) -> Self {
        self.topology_rebuild_interval = interval;
        self
    }

    pub fn with_round(mut self, round: RoundConfig) -> Self {
        self.round = round;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Running,
    Completed,
    Timeout,
    Error,
}

impl RunnerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Error)
    }
}

/// Why a run ended. A `Completed` status carries `AgreementReached`,
/// `RoundsExhausted` or `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    AgreementReached,
    RoundsExhausted,
    Timeout,
    Stopped,
    Failed,
}

/// Cooperative cancellation, observed between rounds only.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub totals: RoundStats,
    /// Fraction of agents whose needs are all satisfied.
    pub agreement_rate: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub id: AgentId,
    pub needs_satisfied: bool,
    pub remaining_needs: Vec<String>,
    pub history_len: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerResult {
    pub status: RunnerStatus,
    pub termination: Option<TerminationReason>,
    pub rounds_executed: usize,
    pub stats: AggregateStats,
    pub agent_results: Vec<AgentResult>,
    pub rounds: Vec<RoundRecord>,
    pub topology_log: Vec<TopologySnapshot>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub struct NegotiationRunner {
    network: Network,
    config: RunnerConfig,
    policy: Box<dyn AgreementPolicy>,
    status: RunnerStatus,
    termination: Option<TerminationReason>,
    current_round: usize,
    started: Option<Instant>,
    elapsed: Duration,
    history: Vec<RoundRecord>,
    topology_log: Vec<TopologySnapshot>,
    topology_built: bool,
    stop: StopHandle,
    error: Option<String>,
}

impl NegotiationRunner {
    pub fn new(network: Network, config: RunnerConfig) -> Self {
        Self {
            network,
            config,
            policy: Box::new(SatisfiedOrConverging::default()),
            status: RunnerStatus::Idle,
            termination: None,
            current_round: 0,
            started: None,
            elapsed: Duration::ZERO,
            history: Vec::new(),
            topology_log: Vec::new(),
            topology_built: false,
            stop: StopHandle::default(),
            error: None,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn AgreementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn current_round(&self) -> usize {
        self.current_round
    }

    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    /// A handle that stops the run at the next round boundary.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs to a terminal status.
    ///
    /// Fails with `RunnerBusy` while a `step()`-driven run is in progress.
    /// A finished runner returns its existing result; call `reset()` first
    /// to run again.
    pub fn run(&mut self) -> Result<RunnerResult> {
        if self.status == RunnerStatus::Running {
            return Err(NegotiationError::RunnerBusy);
        }
        while !self.advance().is_terminal() {}
        Ok(self.result())
    }

    /// Advances at most one round.
    pub fn step(&mut self) -> RunnerStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.advance()
    }

    /// Back to `Idle` with empty history. Agent state is not restored.
    pub fn reset(&mut self) {
        self.status = RunnerStatus::Idle;
        self.termination = None;
        self.current_round = 0;
        self.started = None;
        self.elapsed = Duration::ZERO;
        self.history.clear();
        self.topology_log.clear();
        self.topology_built = false;
        self.error = None;
        self.stop.clear();
    }

    fn advance(&mut self) -> RunnerStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if self.status == RunnerStatus::Idle {
            self.status = RunnerStatus::Running;
            self.started = Some(Instant::now());
            tracing::info!(
                agents = self.network.len(),
                max_rounds = self.config.max_rounds,
                policy = self.policy.name(),
                "negotiation started"
            );
        }

        if self.stop.is_stopped() {
            return self.finish(RunnerStatus::Completed, TerminationReason::Stopped);
        }
        if self.current_round >= self.config.max_rounds {
            return self.finish_exhausted();
        }
        if self.elapsed_now() >= Duration::from_millis(self.config.timeout_ms) {
            return self.finish(RunnerStatus::Timeout, TerminationReason::Timeout);
        }
        if self.agreement_reached() {
            return self.finish(RunnerStatus::Completed, TerminationReason::AgreementReached);
        }

        self.maybe_rebuild();

        let ctx = RoundContext::new(self.current_round);
        let mut round = NegotiationRound::new(ctx, self.config.round.clone());
        match self.network.execute_round(&mut round) {
            Ok(_) => {
                self.history.push(round.into_record(self.network.participants()));
                self.current_round += 1;
            }
            Err(err) => {
                tracing::error!(round = self.current_round, error = %err, "round failed");
                self.error = Some(err.to_string());
                return self.finish(RunnerStatus::Error, TerminationReason::Failed);
            }
        }

        if self.current_round >= self.config.max_rounds {
            return self.finish_exhausted();
        }
        self.status
    }

    fn maybe_rebuild(&mut self) {
        let due = if self.config.dynamic_topology {
            self.current_round % self.config.topology_rebuild_interval.max(1) == 0
        } else {
            !self.topology_built
        };
        if !due {
            return;
        }
        let stats = self.network.rebuild_topology();
        self.topology_built = true;
        tracing::debug!(round = self.current_round, edges = stats.edges, "topology snapshot recorded");
        self.topology_log
            .push(self.network.graph().snapshot(self.current_round));
    }

    fn agreement_reached(&self) -> bool {
        self.policy
            .agreement_reached(self.network.participants(), &self.history)
    }

    fn finish_exhausted(&mut self) -> RunnerStatus {
        let reason = if self.agreement_reached() {
            TerminationReason::AgreementReached
        } else {
            TerminationReason::RoundsExhausted
        };
        self.finish(RunnerStatus::Completed, reason)
    }

    fn finish(&mut self, status: RunnerStatus, reason: TerminationReason) -> RunnerStatus {
        self.elapsed = self.elapsed_now();
        self.status = status;
        self.termination = Some(reason);
        tracing::info!(
            status = ?status,
            reason = ?reason,
            rounds = self.history.len(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "negotiation finished"
        );
        status
    }

    fn elapsed_now(&self) -> Duration {
        match self.started {
            Some(started) if !self.status.is_terminal() => started.elapsed(),
            _ => self.elapsed,
        }
    }

    /// Snapshot of the run so far. Valid at any point, including mid-run.
    pub fn result(&self) -> RunnerResult {
        let mut totals = RoundStats::default();
        for record in &self.history {
            totals.merge(&record.stats);
        }

        let agent_results: Vec<AgentResult> = self
            .network
            .participants()
            .iter()
            .map(|p| AgentResult {
                id: p.id().clone(),
                needs_satisfied: p.agent.needs_satisfied(),
                remaining_needs: p.agent.needs().to_vec(),
                history_len: p.agent.history().len(),
            })
            .collect();
        let satisfied = agent_results.iter().filter(|r| r.needs_satisfied).count();
        let agreement_rate = if agent_results.is_empty() {
            0.0
        } else {
            satisfied as f32 / agent_results.len() as f32
        };

        RunnerResult {
            status: self.status,
            termination: self.termination,
            rounds_executed: self.history.len(),
            stats: AggregateStats {
                totals,
                agreement_rate,
            },
            agent_results,
            rounds: self.history.clone(),
            topology_log: self.topology_log.clone(),
            duration_ms: self.elapsed_now().as_millis() as u64,
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunnerStatus::Idle.is_terminal());
        assert!(!RunnerStatus::Running.is_terminal());
        assert!(RunnerStatus::Completed.is_terminal());
        assert!(RunnerStatus::Timeout.is_terminal());
        assert!(RunnerStatus::Error.is_terminal());
    }

    #[test]
    fn test_stop_handles_share_one_flag() {
        let handle = StopHandle::default();
        let clone = handle.clone();
        clone.stop();
        assert!(handle.is_stopped());
        handle.clear();
        assert!(!clone.is_stopped());
    }
}
