//! One round of negotiation.
//!
//! Agents are processed in registration order. Each agent drains its inbox,
//! answers every message through the handler registered for its type, then
//! may open new negotiations with its graph neighbors. Replies are flushed to
//! the bus after each agent, so later agents see them in the same round.

use crate::bus::MessageBus;
use negotopo_agents::strategy::{best_need_match, choose_offer};
use negotopo_agents::{Action, BeliefUpdate, Participant, StrategyContext};
use negotopo_core::{
    now_ms, AgentEvent, AgentId, EventKind, Message, MessageType, NegotiationError, Payload,
    Result, RoundContext,
};
use negotopo_graph::CommunicationGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Pre-filter applied before sending an unsolicited offer to a neighbor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceFilter {
    /// Every neighbor is worth an offer.
    #[default]
    Permissive,
    /// Only neighbors sharing a need/offer substring with us.
    Strict,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundConfig {
    pub relevance: RelevanceFilter,
    /// Ignore offers, counters and queries from non-neighbors and drop
    /// replies to peers that are no longer neighbors.
    pub enforce_adjacency: bool,
    /// Agents with needs but nothing to offer query neighbors they know nothing about.
    pub query_unknown_peers: bool,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            relevance: RelevanceFilter::Permissive,
            enforce_adjacency: false,
            query_unknown_peers: true,
        }
    }
}

impl RoundConfig {
    pub fn with_relevance(mut self, relevance: RelevanceFilter) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_enforce_adjacency(mut self, enforce: bool) -> Self {
        self.enforce_adjacency = enforce;
        self
    }

    pub fn with_query_unknown_peers(mut self, query: bool) -> Self {
        self.query_unknown_peers = query;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Pending,
    Executing,
    Completed,
}

/// Counters for messages created during a round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStats {
    pub offers: usize,
    pub counters: usize,
    pub acceptances: usize,
    pub rejections: usize,
    pub queries: usize,
    pub messages_sent: usize,
    pub messages_processed: usize,
    pub dropped: usize,
    pub handler_errors: usize,
}

impl RoundStats {
    pub fn merge(&mut self, other: &RoundStats) {
        self.offers += other.offers;
        self.counters += other.counters;
        self.acceptances += other.acceptances;
        self.rejections += other.rejections;
        self.queries += other.queries;
        self.messages_sent += other.messages_sent;
        self.messages_processed += other.messages_processed;
        self.dropped += other.dropped;
        self.handler_errors += other.handler_errors;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub satisfied: bool,
    /// Accepts this agent sent during the round.
    pub agreements: usize,
    pub ts_unix_ms: u64,
    /// Last isolated handler failure, if any.
    pub error: Option<String>,
}

impl AgentOutcome {
    fn new(satisfied: bool) -> Self {
        Self {
            satisfied,
            agreements: 0,
            ts_unix_ms: now_ms(),
            error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round: usize,
    pub stats: RoundStats,
    pub duration_ms: u64,
}

/// Audit record of a finished round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    pub messages: Vec<Message>,
    pub stats: RoundStats,
    pub outcomes: BTreeMap<AgentId, AgentOutcome>,
    pub duration_ms: u64,
}

/// Mutable state a message handler may touch besides its own agent.
struct Scope<'s> {
    ctx: RoundContext,
    stats: &'s mut RoundStats,
    outcomes: &'s mut BTreeMap<AgentId, AgentOutcome>,
    outbox: &'s mut Vec<Message>,
}

type Handler = fn(&mut Participant, &Message, &mut Scope<'_>) -> Result<()>;

fn handler_for(kind: MessageType) -> Handler {
    match kind {
        MessageType::Offer => handle_offer,
        MessageType::Counter => handle_counter,
        MessageType::Accept => handle_accept,
        MessageType::Reject => handle_reject,
        MessageType::Query => handle_query,
    }
}

/// Offers, counters and bare queries are answered; accepts, rejects and
/// snapshots are only absorbed.
fn expects_reply(msg: &Message) -> bool {
    match msg.kind {
        MessageType::Offer | MessageType::Counter => true,
        MessageType::Query => matches!(msg.payload, Payload::Query),
        MessageType::Accept | MessageType::Reject => false,
    }
}

fn malformed(msg: &Message, reason: &str) -> NegotiationError {
    NegotiationError::MalformedMessage {
        id: msg.id.clone(),
        reason: reason.to_string(),
    }
}

fn handle_offer(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>) -> Result<()> {
    respond_to_value(p, msg, scope, false)
}

fn handle_counter(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>) -> Result<()> {
    respond_to_value(p, msg, scope, true)
}

/// Shared offer/counter logic. A counter may be accepted or rejected but
/// never countered again.
fn respond_to_value(
    p: &mut Participant,
    msg: &Message,
    scope: &mut Scope<'_>,
    countered: bool,
) -> Result<()> {
    let offered = msg
        .offered_value()
        .ok_or_else(|| malformed(msg, "offer carries no offered value"))?;
    let round = scope.ctx.round;
    let me = p.agent.id().clone();
    p.agent.update_belief(&msg.from, BeliefUpdate::contact(msg.kind));

    let threshold = p.strategy.match_threshold(round);
    let best = best_need_match(p.agent.needs(), offered, threshold);
    let peer_needs = p
        .agent
        .belief(&msg.from)
        .and_then(|b| b.known_needs.clone())
        .unwrap_or_default();

    let decision = {
        let ctx = StrategyContext {
            agent_needs: p.agent.needs(),
            agent_offers: p.agent.offers(),
            incoming_offer: Some(offered),
            round,
            peer: Some(&msg.from),
            peer_needs: &peer_needs,
            best_match: best.as_ref(),
            replying_to_counter: countered,
        };
        p.strategy.evaluate(&ctx)
    };
    tracing::debug!(agent = %me, from = %msg.from, offered, action = ?decision.action, reason = %decision.reason, "evaluated");

    match (decision.action, best) {
        (Action::Accept, Some(m)) => {
            p.agent.remove_need(&m.need);
            scope
                .outbox
                .push(Message::accept(&me, &msg.from, round, offered, &m.need));
            scope.stats.acceptances += 1;
            scope
                .outcomes
                .entry(me.clone())
                .or_insert_with(|| AgentOutcome::new(false))
                .agreements += 1;
            p.agent.record_event(AgentEvent::new(
                round,
                EventKind::OfferAccepted,
                Some(&msg.from),
                format!("'{offered}' satisfied '{}'", m.need),
            ));
        }
        (Action::Reject, _) => send_reject(p, msg, scope, &decision.reason),
        // accept without a matching need falls through to countering
        _ if countered => send_reject(p, msg, scope, "counter not acceptable"),
        _ => {
            let value = decision
                .counter_offer
                .or_else(|| choose_offer(p.agent.offers(), &peer_needs, round));
            match value {
                Some(value) => {
                    p.agent.record_event(AgentEvent::new(
                        round,
                        EventKind::CounterSent,
                        Some(&msg.from),
                        format!("countered '{offered}' with '{value}'"),
                    ));
                    scope
                        .outbox
                        .push(Message::counter(&me, &msg.from, round, value));
                    scope.stats.counters += 1;
                }
                None => send_reject(p, msg, scope, "nothing to counter with"),
            }
        }
    }
    Ok(())
}

fn send_reject(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>, reason: &str) {
    let round = scope.ctx.round;
    let me = p.agent.id().clone();
    scope
        .outbox
        .push(Message::reject(&me, &msg.from, round, reason));
    scope.stats.rejections += 1;
    p.agent.record_event(AgentEvent::new(
        round,
        EventKind::OfferRejected,
        Some(&msg.from),
        reason,
    ));
}

fn handle_accept(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>) -> Result<()> {
    let Payload::Accept {
        accepted_offer,
        satisfied_need,
    } = &msg.payload
    else {
        return Err(malformed(msg, "accept without accepted offer"));
    };
    p.agent
        .update_belief(&msg.from, BeliefUpdate::contact(MessageType::Accept));
    p.agent.remove_need(satisfied_need);
    scope
        .outcomes
        .entry(msg.from.clone())
        .or_insert_with(|| AgentOutcome::new(false));
    p.agent.record_event(AgentEvent::new(
        scope.ctx.round,
        EventKind::AcceptReceived,
        Some(&msg.from),
        format!("'{accepted_offer}' accepted for '{satisfied_need}'"),
    ));
    Ok(())
}

fn handle_reject(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>) -> Result<()> {
    let reason = match &msg.payload {
        Payload::Reject { reason } => reason.as_str(),
        _ => return Err(malformed(msg, "reject without reason")),
    };
    p.agent
        .update_belief(&msg.from, BeliefUpdate::contact(MessageType::Reject));
    p.agent.record_event(AgentEvent::new(
        scope.ctx.round,
        EventKind::RejectReceived,
        Some(&msg.from),
        reason,
    ));
    Ok(())
}

/// A bare query gets a snapshot back; a snapshot is absorbed and not answered.
fn handle_query(p: &mut Participant, msg: &Message, scope: &mut Scope<'_>) -> Result<()> {
    let round = scope.ctx.round;
    match &msg.payload {
        Payload::Query => {
            p.agent
                .update_belief(&msg.from, BeliefUpdate::contact(MessageType::Query));
            scope.outbox.push(Message::snapshot(
                p.agent.id(),
                &msg.from,
                round,
                p.agent.needs().to_vec(),
                p.agent.offers().to_vec(),
            ));
            p.agent.record_event(AgentEvent::new(
                round,
                EventKind::QueryAnswered,
                Some(&msg.from),
                "sent needs/offers snapshot",
            ));
        }
        Payload::Snapshot { needs, offers } => {
            p.agent.update_belief(
                &msg.from,
                BeliefUpdate::snapshot(MessageType::Query, needs.clone(), offers.clone()),
            );
            p.agent.record_event(AgentEvent::new(
                round,
                EventKind::SnapshotReceived,
                Some(&msg.from),
                format!("{} needs, {} offers", needs.len(), offers.len()),
            ));
        }
        _ => return Err(malformed(msg, "query with non-query payload")),
    }
    Ok(())
}

fn related(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Cheap relevance hint between two agents' needs and offers.
pub fn should_communicate(
    filter: RelevanceFilter,
    my_needs: &[String],
    my_offers: &[String],
    peer_needs: &[String],
    peer_offers: &[String],
) -> bool {
    match filter {
        RelevanceFilter::Permissive => true,
        RelevanceFilter::Strict => {
            my_offers
                .iter()
                .any(|o| peer_needs.iter().any(|n| related(n, o)))
                || my_needs
                    .iter()
                    .any(|n| peer_offers.iter().any(|o| related(n, o)))
        }
    }
}

pub struct NegotiationRound {
    ctx: RoundContext,
    config: RoundConfig,
    state: RoundState,
    processed: Vec<Message>,
    stats: RoundStats,
    outcomes: BTreeMap<AgentId, AgentOutcome>,
    duration_ms: u64,
}

impl NegotiationRound {
    pub fn new(ctx: RoundContext, config: RoundConfig) -> Self {
        Self {
            ctx,
            config,
            state: RoundState::Pending,
            processed: Vec::new(),
            stats: RoundStats::default(),
            outcomes: BTreeMap::new(),
            duration_ms: 0,
        }
    }

    pub fn round(&self) -> usize {
        self.ctx.round
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn stats(&self) -> &RoundStats {
        &self.stats
    }

    pub fn processed(&self) -> &[Message] {
        &self.processed
    }

    /// Runs the round once. Failures of a single agent's handlers are
    /// recorded in its outcome; only orchestration faults return `Err`.
    pub fn execute(
        &mut self,
        participants: &mut [Participant],
        graph: &CommunicationGraph,
        bus: &mut MessageBus,
    ) -> Result<RoundResult> {
        if self.state != RoundState::Pending {
            return Err(NegotiationError::AlreadyCompleted(self.ctx.round));
        }
        for p in participants.iter() {
            if !graph.contains(p.id()) || !bus.contains(p.id()) {
                return Err(NegotiationError::Orchestration(format!(
                    "agent '{}' is not registered with the graph and bus",
                    p.id()
                )));
            }
        }

        self.state = RoundState::Executing;
        let started = Instant::now();
        tracing::info!(round = self.ctx.round, agents = participants.len(), "round started");

        let positions: HashMap<AgentId, usize> = participants
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id().clone(), i))
            .collect();

        for idx in 0..participants.len() {
            self.process_inbox(idx, participants, graph, bus);
            self.initiate(idx, participants, &positions, graph, bus);

            let p = &participants[idx];
            if p.agent.needs_satisfied() {
                let outcome = self
                    .outcomes
                    .entry(p.id().clone())
                    .or_insert_with(|| AgentOutcome::new(true));
                outcome.satisfied = true;
                outcome.ts_unix_ms = now_ms();
            }
        }

        for p in participants.iter() {
            if let Some(outcome) = self.outcomes.get_mut(p.id()) {
                outcome.satisfied = p.agent.needs_satisfied();
            }
        }

        self.duration_ms = started.elapsed().as_millis() as u64;
        self.state = RoundState::Completed;
        tracing::info!(
            round = self.ctx.round,
            offers = self.stats.offers,
            counters = self.stats.counters,
            acceptances = self.stats.acceptances,
            rejections = self.stats.rejections,
            errors = self.stats.handler_errors,
            "round completed"
        );

        Ok(RoundResult {
            round: self.ctx.round,
            stats: self.stats.clone(),
            duration_ms: self.duration_ms,
        })
    }

    fn process_inbox(
        &mut self,
        idx: usize,
        participants: &mut [Participant],
        graph: &CommunicationGraph,
        bus: &mut MessageBus,
    ) {
        let id = participants[idx].id().clone();
        let mut outbox = Vec::new();

        for msg in bus.inbox(&id, self.ctx.round) {
            // A reply to a non-neighbor would be dropped at flush, so the
            // message is dropped before it can change any state.
            if self.config.enforce_adjacency
                && expects_reply(&msg)
                && !graph.neighbors(&id).contains(&msg.from)
            {
                tracing::warn!(agent = %id, from = %msg.from, kind = %msg.kind, "message from non-neighbor dropped");
                self.stats.dropped += 1;
                continue;
            }
            let handler = handler_for(msg.kind);
            let outcome = {
                let mut scope = Scope {
                    ctx: self.ctx,
                    stats: &mut self.stats,
                    outcomes: &mut self.outcomes,
                    outbox: &mut outbox,
                };
                handler(&mut participants[idx], &msg, &mut scope)
            };
            if let Err(e) = outcome {
                tracing::warn!(agent = %id, message = %msg.id, "handler failed: {e}");
                self.stats.handler_errors += 1;
                let agent = &mut participants[idx].agent;
                agent.record_event(AgentEvent::new(
                    self.ctx.round,
                    EventKind::HandlerFailed,
                    Some(&msg.from),
                    e.to_string(),
                ));
                let satisfied = agent.needs_satisfied();
                self.outcomes
                    .entry(id.clone())
                    .or_insert_with(|| AgentOutcome::new(satisfied))
                    .error = Some(e.to_string());
            }
            self.stats.messages_processed += 1;
            self.processed.push(msg);
        }

        self.flush(&id, outbox, graph, bus);
    }

    /// Unsolicited offers to neighbors, or queries when there is nothing to offer.
    fn initiate(
        &mut self,
        idx: usize,
        participants: &mut [Participant],
        positions: &HashMap<AgentId, usize>,
        graph: &CommunicationGraph,
        bus: &mut MessageBus,
    ) {
        let round = self.ctx.round;
        let id = participants[idx].id().clone();
        let peers: Vec<(AgentId, Vec<String>, Vec<String>)> = graph
            .neighbors(&id)
            .iter()
            .filter_map(|n| {
                let peer = &participants[*positions.get(n)?].agent;
                Some((n.clone(), peer.needs().to_vec(), peer.offers().to_vec()))
            })
            .collect();
        if peers.is_empty() {
            return;
        }

        let p = &mut participants[idx];
        let initiate = {
            let ctx = StrategyContext {
                agent_needs: p.agent.needs(),
                agent_offers: p.agent.offers(),
                incoming_offer: None,
                round,
                peer: None,
                peer_needs: &[],
                best_match: None,
                replying_to_counter: false,
            };
            p.strategy.should_initiate(&ctx)
        };

        let mut outbox = Vec::new();
        if initiate {
            for (peer, peer_needs, peer_offers) in &peers {
                if !should_communicate(
                    self.config.relevance,
                    p.agent.needs(),
                    p.agent.offers(),
                    peer_needs,
                    peer_offers,
                ) {
                    continue;
                }
                let proposal = {
                    let ctx = StrategyContext {
                        agent_needs: p.agent.needs(),
                        agent_offers: p.agent.offers(),
                        incoming_offer: None,
                        round,
                        peer: Some(peer),
                        peer_needs,
                        best_match: None,
                        replying_to_counter: false,
                    };
                    p.strategy.propose(&ctx)
                };
                if let Some(offer) = proposal {
                    p.agent.record_event(AgentEvent::new(
                        round,
                        EventKind::OfferSent,
                        Some(peer),
                        offer.clone(),
                    ));
                    outbox.push(Message::offer(&id, peer, round, offer));
                    self.stats.offers += 1;
                }
            }
        } else if self.config.query_unknown_peers
            && !p.agent.needs_satisfied()
            && p.agent.offers().is_empty()
        {
            for (peer, _, _) in &peers {
                if p.agent.belief(peer).is_some() {
                    continue;
                }
                p.agent.record_event(AgentEvent::new(
                    round,
                    EventKind::QuerySent,
                    Some(peer),
                    "asking for needs/offers",
                ));
                outbox.push(Message::query(&id, peer, round));
                self.stats.queries += 1;
            }
        }

        self.flush(&id, outbox, graph, bus);
    }

    fn flush(
        &mut self,
        from: &AgentId,
        outbox: Vec<Message>,
        graph: &CommunicationGraph,
        bus: &mut MessageBus,
    ) {
        for msg in outbox {
            if self.config.enforce_adjacency && !graph.neighbors(from).contains(&msg.to) {
                tracing::warn!(from = %from, to = %msg.to, kind = %msg.kind, "reply dropped, peer is not a neighbor");
                self.stats.dropped += 1;
                continue;
            }
            if bus.send(msg) {
                self.stats.messages_sent += 1;
            } else {
                self.stats.dropped += 1;
            }
        }
    }

    /// Per-agent outcomes. Agents without a recorded entry default to
    /// whether their needs are satisfied.
    pub fn outcome(&self, participants: &[Participant]) -> BTreeMap<AgentId, AgentOutcome> {
        let mut out = self.outcomes.clone();
        for p in participants {
            out.entry(p.id().clone())
                .or_insert_with(|| AgentOutcome::new(p.agent.needs_satisfied()));
        }
        out
    }

    /// Consumes a completed round into its audit record.
    pub fn into_record(self, participants: &[Participant]) -> RoundRecord {
        let outcomes = self.outcome(participants);
        RoundRecord {
            round: self.ctx.round,
            messages: self.processed,
            stats: self.stats,
            outcomes,
            duration_ms: self.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_permissive_filter_always_communicates() {
        assert!(should_communicate(RelevanceFilter::Permissive, &[], &[], &[], &[]));
    }

    #[test]
    fn test_strict_filter_needs_substring_overlap() {
        let yes = should_communicate(
            RelevanceFilter::Strict,
            &[],
            &s(&["logo design"]),
            &s(&["design"]),
            &[],
        );
        let no = should_communicate(
            RelevanceFilter::Strict,
            &s(&["tax"]),
            &s(&["logo"]),
            &s(&["plumbing"]),
            &s(&["gardening"]),
        );
        assert!(yes);
        assert!(!no);
    }

    #[test]
    fn test_stats_merge_sums_fields() {
        let mut a = RoundStats {
            offers: 1,
            acceptances: 2,
            ..RoundStats::default()
        };
        a.merge(&RoundStats {
            offers: 3,
            rejections: 1,
            ..RoundStats::default()
        });
        assert_eq!(a.offers, 4);
        assert_eq!(a.acceptances, 2);
        assert_eq!(a.rejections, 1);
    }

    #[test]
    fn test_handlers_dispatch_by_message_type() {
        use negotopo_agents::BasicAgent;

        let agent = BasicAgent::new("me").with_needs(["tea"]).with_offers(["milk"]);
        let mut p = Participant::new(Box::new(agent), 0).unwrap();
        let me = AgentId::from("me");
        let peer = AgentId::from("peer");
        let mut stats = RoundStats::default();
        let mut outcomes = BTreeMap::new();
        let mut outbox = Vec::new();
        let mut scope = Scope {
            ctx: RoundContext::new(0),
            stats: &mut stats,
            outcomes: &mut outcomes,
            outbox: &mut outbox,
        };

        handler_for(MessageType::Query)(&mut p, &Message::query(&peer, &me, 0), &mut scope)
            .unwrap();
        handler_for(MessageType::Offer)(&mut p, &Message::offer(&peer, &me, 0, "tea"), &mut scope)
            .unwrap();
        let bad = Message::new(MessageType::Reject, &peer, &me, 0, Payload::Query);
        let err = handler_for(MessageType::Reject)(&mut p, &bad, &mut scope).unwrap_err();
        assert!(matches!(err, NegotiationError::MalformedMessage { .. }));

        assert_eq!(outbox.len(), 2);
        assert!(matches!(outbox[0].payload, Payload::Snapshot { .. }));
        assert_eq!(outbox[1].kind, MessageType::Accept);
        assert_eq!(stats.acceptances, 1);
        assert_eq!(outcomes[&me].agreements, 1);
        assert!(p.agent.needs_satisfied());
    }

    #[test]
    fn test_only_offers_counters_and_bare_queries_expect_replies() {
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        assert!(expects_reply(&Message::offer(&a, &b, 0, "x")));
        assert!(expects_reply(&Message::counter(&a, &b, 0, "x")));
        assert!(expects_reply(&Message::query(&a, &b, 0)));
        assert!(!expects_reply(&Message::snapshot(&a, &b, 0, vec![], vec![])));
        assert!(!expects_reply(&Message::reject(&a, &b, 0, "no")));
        assert!(!expects_reply(&Message::accept(&a, &b, 0, "x", "y")));
    }
}
