//! Network ownership and the negotiation round loop.

use negotopo_agents::{Agent, Participant, Strategy};
use negotopo_core::{AgentId, GraphStats, Message, NegotiationError, Result};
use negotopo_graph::{CommunicationGraph, GraphConfig};
use negotopo_oracle::CompatibilityOracle;
use negotopo_protocol::{MessageBus, NegotiationRound, RoundResult};
use std::sync::Arc;

pub mod policy;
pub mod runner;

pub use policy::{AgreementPolicy, AllSatisfied, RecentAcceptances, SatisfiedOrConverging};
pub use runner::{
    AgentResult, AggregateStats, NegotiationRunner, RunnerConfig, RunnerResult, RunnerStatus,
    StopHandle, TerminationReason,
};

/// Owns the graph, the bus and the registered agents.
///
/// Registration order is preserved; rounds process agents in that order.
pub struct Network {
    graph: CommunicationGraph,
    bus: MessageBus,
    participants: Vec<Participant>,
    seed: u64,
}

impl Network {
    pub fn new(config: GraphConfig, oracle: Arc<dyn CompatibilityOracle>) -> Self {
        Self {
            graph: CommunicationGraph::new(config, oracle),
            bus: MessageBus::new(),
            participants: Vec::new(),
            seed: 0,
        }
    }

    /// Base seed for randomized strategies; each agent gets its own stream.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Registers an agent with the strategy named by its `strategy_name()`.
    pub fn register_agent(&mut self, agent: Box<dyn Agent>) -> Result<()> {
        let seed = self
            .seed
            .wrapping_add((self.participants.len() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let participant = Participant::new(agent, seed)?;
        self.admit(participant)
    }

    pub fn register_with_strategy(
        &mut self,
        agent: Box<dyn Agent>,
        strategy: Box<dyn Strategy>,
    ) -> Result<()> {
        self.admit(Participant::with_strategy(agent, strategy))
    }

    fn admit(&mut self, participant: Participant) -> Result<()> {
        let id = participant.id().clone();
        if self.graph.contains(&id) || self.bus.contains(&id) {
            return Err(NegotiationError::DuplicateNode(id));
        }
        self.graph.register(&id)?;
        self.bus.register(&id)?;
        tracing::debug!(agent = %id, strategy = participant.strategy.name(), "agent registered");
        self.participants.push(participant);
        Ok(())
    }

    /// Removes the agent from graph, bus and registry. `None` for unknown ids.
    pub fn unregister_agent(&mut self, id: &AgentId) -> Option<Box<dyn Agent>> {
        let pos = self.participants.iter().position(|p| p.id() == id)?;
        self.graph.unregister(id);
        self.bus.unregister(id);
        Some(self.participants.remove(pos).agent)
    }

    /// Full first-fit rebuild from the agents' current needs and offers.
    pub fn rebuild_topology(&mut self) -> GraphStats {
        let profiles: Vec<_> = self.participants.iter().map(|p| p.agent.profile()).collect();
        self.graph.rebuild(&profiles)
    }

    /// Re-ranks one agent's edges. Returns its new degree.
    pub fn update_agent_topology(&mut self, id: &AgentId) -> Result<usize> {
        let profiles: Vec<_> = self.participants.iter().map(|p| p.agent.profile()).collect();
        self.graph.update_one(id, &profiles)
    }

    /// Queues a query for `to`'s needs and offers, answered when `to` next runs.
    pub fn send_query(&mut self, from: &AgentId, to: &AgentId, round: usize) -> bool {
        self.bus.send(Message::query(from, to, round))
    }

    pub fn execute_round(&mut self, round: &mut NegotiationRound) -> Result<RoundResult> {
        round.execute(&mut self.participants, &self.graph, &mut self.bus)
    }

    pub fn participant(&self, id: &AgentId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id() == id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn graph(&self) -> &CommunicationGraph {
        &self.graph
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Direct bus access for injecting messages or tearing down inboxes.
    pub fn bus_mut(&mut self) -> &mut MessageBus {
        &mut self.bus
    }
}
