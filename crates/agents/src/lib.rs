//! Negotiating agents and their strategies.
//!
//! The round engine never holds a concrete agent type. It sees an agent
//! through the [`Agent`] capability trait, which only exposes the reads and
//! narrow mutations a round may perform.

use negotopo_core::{now_ms, AgentEvent, AgentId, MessageType, NodeProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod strategy;

pub use strategy::{Action, Decision, Strategy, StrategyContext};

/// Capabilities the negotiation core needs from an agent.
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;
    fn needs(&self) -> &[String];
    fn offers(&self) -> &[String];
    /// Name of the strategy this agent negotiates with.
    fn strategy_name(&self) -> &str;

    /// Removes the first need equal to `need`. Returns whether one was removed.
    fn remove_need(&mut self, need: &str) -> bool;
    fn record_event(&mut self, event: AgentEvent);
    fn update_belief(&mut self, peer: &AgentId, update: BeliefUpdate);

    fn belief(&self, peer: &AgentId) -> Option<&Belief>;
    fn history(&self) -> &[AgentEvent];

    fn needs_satisfied(&self) -> bool {
        self.needs().is_empty()
    }

    fn profile(&self) -> NodeProfile<'_> {
        NodeProfile {
            id: self.id(),
            needs: self.needs(),
            offers: self.offers(),
        }
    }
}

/// What an agent remembers about one peer. Bookkeeping only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    pub last_contact_ms: u64,
    pub last_message: Option<MessageType>,
    pub interactions: usize,
    pub known_needs: Option<Vec<String>>,
    pub known_offers: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default)]
pub struct BeliefUpdate {
    pub message: Option<MessageType>,
    pub needs: Option<Vec<String>>,
    pub offers: Option<Vec<String>>,
}

impl BeliefUpdate {
    pub fn contact(message: MessageType) -> Self {
        Self {
            message: Some(message),
            ..Self::default()
        }
    }

    pub fn snapshot(message: MessageType, needs: Vec<String>, offers: Vec<String>) -> Self {
        Self {
            message: Some(message),
            needs: Some(needs),
            offers: Some(offers),
        }
    }
}

/// Plain in-memory agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicAgent {
    id: AgentId,
    needs: Vec<String>,
    offers: Vec<String>,
    strategy: String,
    beliefs: BTreeMap<AgentId, Belief>,
    history: Vec<AgentEvent>,
}

impl BasicAgent {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            needs: Vec::new(),
            offers: Vec::new(),
            strategy: strategy::DEFAULT_STRATEGY.to_string(),
            beliefs: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offers<I, S>(mut self, offers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.offers = offers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn beliefs(&self) -> &BTreeMap<AgentId, Belief> {
        &self.beliefs
    }
}

impl Agent for BasicAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn needs(&self) -> &[String] {
        &self.needs
    }

    fn offers(&self) -> &[String] {
        &self.offers
    }

    fn strategy_name(&self) -> &str {
        &self.strategy
    }

    fn remove_need(&mut self, need: &str) -> bool {
        match self.needs.iter().position(|n| n == need) {
            Some(idx) => {
                self.needs.remove(idx);
                true
            }
            None => false,
        }
    }

    fn record_event(&mut self, event: AgentEvent) {
        self.history.push(event);
    }

    fn update_belief(&mut self, peer: &AgentId, update: BeliefUpdate) {
        let belief = self.beliefs.entry(peer.clone()).or_default();
        belief.last_contact_ms = now_ms();
        belief.interactions += 1;
        if update.message.is_some() {
            belief.last_message = update.message;
        }
        if update.needs.is_some() {
            belief.known_needs = update.needs;
        }
        if update.offers.is_some() {
            belief.known_offers = update.offers;
        }
    }

    fn belief(&self, peer: &AgentId) -> Option<&Belief> {
        self.beliefs.get(peer)
    }

    fn history(&self) -> &[AgentEvent] {
        &self.history
    }
}

/// An agent paired with the live strategy instance that drives it.
pub struct Participant {
    pub agent: Box<dyn Agent>,
    pub strategy: Box<dyn Strategy>,
}

impl Participant {
    /// Resolves the agent's strategy name through [`strategy::from_name`].
    pub fn new(agent: Box<dyn Agent>, seed: u64) -> negotopo_core::Result<Self> {
        let strategy = strategy::from_name(agent.strategy_name(), seed)?;
        Ok(Self { agent, strategy })
    }

    pub fn with_strategy(agent: Box<dyn Agent>, strategy: Box<dyn Strategy>) -> Self {
        Self { agent, strategy }
    }

    pub fn id(&self) -> &AgentId {
        self.agent.id()
    }
}
